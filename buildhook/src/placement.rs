//! Slot placement under the global admission lock.
//!
//! A placement decision is the only critical section in the hook. The main
//! lock linearizes decisions across all concurrent hook processes, so the
//! slot occupancy observed during the probe is still true at the moment the
//! winning slot is acquired. The lock is never held across network I/O.

use std::cmp::Ordering;
use std::collections::HashSet;

use buildhook_shared::errors::{HookError, HookResult};

use crate::layout::StateLayout;
use crate::lock::LockFile;
use crate::machines::{Machine, MachineRegistry};
use crate::request::BuildRequest;

/// Outcome of one placement attempt.
#[derive(Debug)]
pub enum Decision {
    /// A slot was acquired; the caller owns it until process exit.
    Accept(Accepted),
    /// Every compatible machine is at capacity; worth asking again later.
    Postpone,
    /// No enabled machine will ever serve this request in this process.
    Decline,
}

/// The winning machine and its held slot lock.
#[derive(Debug)]
pub struct Accepted {
    pub machine: Machine,
    pub slot: u32,
    pub slot_lock: LockFile,
}

struct Candidate<'a> {
    machine: &'a Machine,
    load: u32,
    free_slot: u32,
}

/// `round(load / speed)` with the bit-exact `floor(x + 0.4999)` rounding the
/// ranking is defined in terms of.
fn load_rank(load: u32, speed_factor: f64) -> u64 {
    ((load as f64 / speed_factor) + 0.4999).floor() as u64
}

/// Decide where to run a build, or whether to run it remotely at all.
///
/// Executed entirely under the main lock, which is released before
/// returning. On `Accept` the chosen slot's lock is already held.
pub fn place(
    registry: &MachineRegistry,
    disabled: &HashSet<String>,
    request: &BuildRequest,
    local_system: &str,
    layout: &StateLayout,
) -> HookResult<Decision> {
    let mut main_lock = LockFile::open(&layout.main_lock_path())?;
    main_lock.lock_exclusive()?;

    let mut right_type = false;
    let mut candidates: Vec<Candidate<'_>> = Vec::new();

    for machine in registry.machines() {
        if disabled.contains(&machine.host_name) {
            continue;
        }
        if !machine.supports_system(&request.needed_system) {
            continue;
        }
        if !machine.supports_features(
            request
                .required_features
                .iter()
                .chain(machine.mandatory_features.iter()),
        ) {
            continue;
        }
        if !machine.mandatory_met(&request.required_features) {
            continue;
        }
        if machine.max_jobs == 0 {
            continue;
        }
        right_type = true;

        // Probe every slot: a failed non-blocking acquire means some hook
        // holds it, a successful one is released immediately.
        let mut load = 0u32;
        let mut free_slot = None;
        for slot in 0..machine.max_jobs {
            let mut slot_lock = LockFile::open(&layout.slot_lock_path(machine, slot))?;
            if slot_lock.probe_free()? {
                if free_slot.is_none() {
                    free_slot = Some(slot);
                }
            } else {
                load += 1;
            }
        }

        tracing::debug!(
            host = %machine.host_name,
            load,
            free_slot = ?free_slot,
            "placement candidate"
        );

        if let Some(free_slot) = free_slot {
            candidates.push(Candidate {
                machine,
                load,
                free_slot,
            });
        }
    }

    if candidates.is_empty() {
        main_lock.unlock()?;
        let local_fallback = request.am_willing && local_system == request.needed_system;
        return Ok(if right_type && !local_fallback {
            Decision::Postpone
        } else {
            Decision::Decline
        });
    }

    // Lowest speed-weighted load first; at equal rank prefer the faster
    // machine, then the one with fewer builds running.
    candidates.sort_by(|a, b| {
        load_rank(a.load, a.machine.speed_factor)
            .cmp(&load_rank(b.load, b.machine.speed_factor))
            .then_with(|| {
                b.machine
                    .speed_factor
                    .partial_cmp(&a.machine.speed_factor)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.load.cmp(&b.load))
    });
    let best = &candidates[0];

    let mut slot_lock = LockFile::open(&layout.slot_lock_path(best.machine, best.free_slot))?;
    if !slot_lock.try_lock_exclusive()? {
        // The probe ran under the main lock, so the slot cannot have been
        // taken by another placement decision.
        return Err(HookError::Internal(format!(
            "slot {} on '{}' was taken while the placement lock was held",
            best.free_slot, best.machine.host_name
        )));
    }
    slot_lock.touch()?;

    let accepted = Accepted {
        machine: best.machine.clone(),
        slot: best.free_slot,
        slot_lock,
    };
    main_lock.unlock()?;
    Ok(Decision::Accept(accepted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> StateLayout {
        StateLayout::new(dir.path().join("state"), dir.path().join("no-key"))
    }

    fn request(am_willing: bool, system: &str, features: &[&str]) -> BuildRequest {
        BuildRequest {
            am_willing,
            needed_system: system.to_string(),
            drv_path: "/nix/store/abc-x.drv".to_string(),
            required_features: features.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn registry(lines: &str) -> MachineRegistry {
        MachineRegistry::parse(lines).unwrap()
    }

    fn hold_slot(layout: &StateLayout, registry: &MachineRegistry, index: usize, slot: u32) -> LockFile {
        let machine = &registry.machines()[index];
        let mut lock = LockFile::open(&layout.slot_lock_path(machine, slot)).unwrap();
        assert!(lock.try_lock_exclusive().unwrap());
        lock
    }

    #[test]
    fn rounding_is_floor_plus_point_4999() {
        assert_eq!(load_rank(0, 1.0), 0);
        assert_eq!(load_rank(1, 2.0), 0); // 0.5 + 0.4999 < 1
        assert_eq!(load_rank(3, 2.0), 1); // 1.5 + 0.4999 < 2
        assert_eq!(load_rank(2, 1.0), 2);
        assert_eq!(load_rank(5, 4.0), 1);
    }

    #[test]
    fn declines_without_matching_platform() {
        let dir = TempDir::new().unwrap();
        let reg = registry("host1 x86_64-linux /k 2 1\n");
        let decision = place(
            &reg,
            &HashSet::new(),
            &request(true, "aarch64-linux", &[]),
            "aarch64-linux",
            &layout(&dir),
        )
        .unwrap();
        assert!(matches!(decision, Decision::Decline));
    }

    #[test]
    fn declines_on_empty_registry() {
        let dir = TempDir::new().unwrap();
        let reg = MachineRegistry::default();
        let decision = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &[]),
            "aarch64-linux",
            &layout(&dir),
        )
        .unwrap();
        assert!(matches!(decision, Decision::Decline));
    }

    #[test]
    fn postpones_when_all_slots_busy() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        let reg = registry("host1 x86_64-linux /k 2 1\n");

        let _s0 = hold_slot(&layout, &reg, 0, 0);
        let _s1 = hold_slot(&layout, &reg, 0, 1);

        let decision = place(
            &reg,
            &HashSet::new(),
            &request(true, "x86_64-linux", &[]),
            "aarch64-linux",
            &layout,
        )
        .unwrap();
        assert!(matches!(decision, Decision::Postpone));
    }

    #[test]
    fn busy_with_willing_local_match_declines() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        let reg = registry("host1 x86_64-linux /k 1 1\n");

        let _s0 = hold_slot(&layout, &reg, 0, 0);

        let decision = place(
            &reg,
            &HashSet::new(),
            &request(true, "x86_64-linux", &[]),
            "x86_64-linux",
            &layout,
        )
        .unwrap();
        assert!(matches!(decision, Decision::Decline));
    }

    #[test]
    fn accepts_lowest_free_slot() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        let reg = registry("host1 x86_64-linux /k 4 2 big,kvm\n");

        let decision = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &["big", "kvm"]),
            "x86_64-linux",
            &layout,
        )
        .unwrap();
        let accepted = match decision {
            Decision::Accept(accepted) => accepted,
            other => panic!("expected accept, got {:?}", other),
        };
        assert_eq!(accepted.machine.host_name, "host1");
        assert_eq!(accepted.slot, 0);
        assert!(accepted.slot_lock.is_held());
        assert!(layout.slot_lock_path(&accepted.machine, 0).exists());
    }

    #[test]
    fn accepted_slot_stays_locked_for_other_hooks() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        let reg = registry("host1 x86_64-linux /k 2 1\n");

        let first = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &[]),
            "x86_64-linux",
            &layout,
        )
        .unwrap();
        let first = match first {
            Decision::Accept(accepted) => accepted,
            other => panic!("expected accept, got {:?}", other),
        };
        assert_eq!(first.slot, 0);

        // A second hook process must land on the next slot.
        let second = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &[]),
            "x86_64-linux",
            &layout,
        )
        .unwrap();
        let second = match second {
            Decision::Accept(accepted) => accepted,
            other => panic!("expected accept, got {:?}", other),
        };
        assert_eq!(second.slot, 1);

        // And a third finds the machine full.
        let third = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &[]),
            "aarch64-linux",
            &layout,
        )
        .unwrap();
        assert!(matches!(third, Decision::Postpone));
    }

    #[test]
    fn ranks_by_speed_factor_at_equal_load() {
        let dir = TempDir::new().unwrap();
        let reg = registry("slow x86_64-linux /k 1 1\nfast x86_64-linux /k 1 4\n");

        let decision = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &[]),
            "x86_64-linux",
            &layout(&dir),
        )
        .unwrap();
        match decision {
            Decision::Accept(accepted) => assert_eq!(accepted.machine.host_name, "fast"),
            other => panic!("expected accept, got {:?}", other),
        }
    }

    #[test]
    fn mandatory_feature_not_requested_declines() {
        let dir = TempDir::new().unwrap();
        let reg = registry("sec x86_64-linux /k 1 1 kvm kvm\n");

        let decision = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &[]),
            "aarch64-linux",
            &layout(&dir),
        )
        .unwrap();
        assert!(matches!(decision, Decision::Decline));
    }

    #[test]
    fn unsupported_required_feature_declines() {
        let dir = TempDir::new().unwrap();
        let reg = registry("host1 x86_64-linux /k 1 1 kvm\n");

        let decision = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &["cuda"]),
            "aarch64-linux",
            &layout(&dir),
        )
        .unwrap();
        assert!(matches!(decision, Decision::Decline));
    }

    #[test]
    fn max_jobs_zero_is_never_selected() {
        let dir = TempDir::new().unwrap();
        let reg = registry("host1 x86_64-linux /k 0 1\n");

        let decision = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &[]),
            "aarch64-linux",
            &layout(&dir),
        )
        .unwrap();
        assert!(matches!(decision, Decision::Decline));
    }

    #[test]
    fn disabled_machine_is_skipped() {
        let dir = TempDir::new().unwrap();
        let reg = registry("host1 x86_64-linux /k 2 1\n");
        let disabled: HashSet<String> = ["host1".to_string()].into_iter().collect();

        let decision = place(
            &reg,
            &disabled,
            &request(false, "x86_64-linux", &[]),
            "aarch64-linux",
            &layout(&dir),
        )
        .unwrap();
        assert!(matches!(decision, Decision::Decline));
    }

    #[test]
    fn speed_still_breaks_the_tie_under_load() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        // fast has 1 of 2 slots busy: rank round(1/2) = 0, same as slow's
        // round(0/1) = 0, so speed still wins the tie.
        let reg = registry("slow x86_64-linux /k 1 1\nfast x86_64-linux /k 2 2\n");
        let _busy = hold_slot(&layout, &reg, 1, 0);

        let decision = place(
            &reg,
            &HashSet::new(),
            &request(false, "x86_64-linux", &[]),
            "x86_64-linux",
            &layout,
        )
        .unwrap();
        match decision {
            Decision::Accept(accepted) => {
                assert_eq!(accepted.machine.host_name, "fast");
                assert_eq!(accepted.slot, 1);
            }
            other => panic!("expected accept, got {:?}", other),
        }
    }
}
