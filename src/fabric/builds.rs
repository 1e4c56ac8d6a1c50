//! Program build fan-in.
//!
//! A build names K devices, possibly on several nodes. Each node reports
//! `ProgramBuildComplete` per device; the listener fires once after all K
//! reports, with the results in request order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::listeners::{BuildListener, BuildReport};
use crate::types::{Error, ObjectId, PeerId, Result};

struct PendingBuild {
    devices: Vec<ObjectId>,
    /// Connection each device's report is expected on.
    peers: Vec<PeerId>,
    statuses: Vec<Option<i32>>,
    remaining: usize,
    listener: Arc<dyn BuildListener>,
}

impl PendingBuild {
    /// Record `status` for the first unreported slot matching `matches`.
    fn record(&mut self, status: i32, matches: impl Fn(usize) -> bool) -> bool {
        for i in 0..self.devices.len() {
            if self.statuses[i].is_none() && matches(i) {
                self.statuses[i] = Some(status);
                self.remaining -= 1;
                return true;
            }
        }
        false
    }

    fn report(&self, program: ObjectId) -> BuildReport {
        BuildReport {
            program,
            results: self
                .devices
                .iter()
                .zip(&self.statuses)
                .map(|(device, status)| (*device, status.unwrap_or_default()))
                .collect(),
        }
    }
}

#[derive(Default)]
pub struct BuildAggregator {
    builds: Mutex<HashMap<ObjectId, PendingBuild>>,
}

impl std::fmt::Debug for BuildAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildAggregator")
            .field("pending", &self.pending())
            .finish()
    }
}

impl BuildAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start aggregating a build over `devices` (device, hosting connection).
    pub fn begin(
        &self,
        program: ObjectId,
        devices: Vec<(ObjectId, PeerId)>,
        listener: Arc<dyn BuildListener>,
    ) -> Result<()> {
        if devices.is_empty() {
            return Err(Error::validation("build needs at least one device"));
        }
        let mut builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
        if builds.contains_key(&program) {
            return Err(Error::state_transition(format!(
                "a build of {} is already in progress",
                program
            )));
        }
        let (devices, peers): (Vec<_>, Vec<_>) = devices.into_iter().unzip();
        let remaining = devices.len();
        builds.insert(
            program,
            PendingBuild {
                statuses: vec![None; remaining],
                devices,
                peers,
                remaining,
                listener,
            },
        );
        Ok(())
    }

    pub fn is_pending(&self, program: ObjectId) -> bool {
        self.builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&program)
    }

    pub fn pending(&self) -> usize {
        self.builds.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Record one device report. Returns whether it completed the build.
    pub fn report(&self, program: ObjectId, device: ObjectId, status: i32) -> bool {
        self.record(program, status, |build, i| build.devices[i] == device)
    }

    /// Report every still-pending device in `devices` with `status`.
    pub fn fail_devices(&self, program: ObjectId, devices: &[ObjectId], status: i32) -> bool {
        let mut done = false;
        for device in devices {
            done |= self.report(program, *device, status);
        }
        done
    }

    /// Expect the still-open reports for `devices` over `peer`. Used when the
    /// build request went out on a different connection than the one recorded
    /// at [`BuildAggregator::begin`]. Returns how many slots moved.
    pub fn rebind(&self, program: ObjectId, devices: &[ObjectId], peer: PeerId) -> usize {
        let mut builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
        let Some(build) = builds.get_mut(&program) else {
            return 0;
        };
        let mut moved = 0;
        for i in 0..build.devices.len() {
            if build.statuses[i].is_none()
                && build.peers[i] != peer
                && devices.contains(&build.devices[i])
            {
                build.peers[i] = peer;
                moved += 1;
            }
        }
        moved
    }

    /// A connection dropped: every device still expected over it reports
    /// `status`.
    pub fn fail_peer(&self, peer: PeerId, status: i32) -> usize {
        let expected: Vec<(ObjectId, usize)> = self
            .builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(program, build)| {
                let open = build
                    .peers
                    .iter()
                    .zip(&build.statuses)
                    .filter(|(p, s)| **p == peer && s.is_none())
                    .count();
                (*program, open)
            })
            .filter(|(_, open)| *open > 0)
            .collect();

        let mut completed = 0;
        for (program, open) in expected {
            for _ in 0..open {
                if self.record(program, status, |build, i| build.peers[i] == peer) {
                    completed += 1;
                    break;
                }
            }
        }
        completed
    }

    /// Drop a pending build without notifying its listener.
    pub fn cancel(&self, program: ObjectId) -> bool {
        let cancelled = self
            .builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&program)
            .is_some();
        if cancelled {
            tracing::debug!(%program, "pending build cancelled");
        }
        cancelled
    }

    fn record(
        &self,
        program: ObjectId,
        status: i32,
        matches: impl Fn(&PendingBuild, usize) -> bool,
    ) -> bool {
        let finished = {
            let mut builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
            let Some(build) = builds.get_mut(&program) else {
                tracing::debug!(%program, "build report for unknown program dropped");
                return false;
            };
            let slots: Vec<bool> = (0..build.devices.len()).map(|i| matches(build, i)).collect();
            if !build.record(status, |i| slots[i]) {
                tracing::debug!(%program, "build report for unexpected device dropped");
                return false;
            }
            if build.remaining > 0 {
                return false;
            }
            builds.remove(&program)
        };

        // The listener runs outside the lock.
        let Some(build) = finished else {
            return false;
        };
        let report = build.report(program);
        match report.first_failure() {
            None => tracing::info!(%program, "program build complete"),
            Some(code) => tracing::info!(%program, code, "program build failed"),
        }
        build.listener.on_complete(&report);
        true
    }
}
