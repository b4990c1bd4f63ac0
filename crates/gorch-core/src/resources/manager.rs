use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::{GroupStatus, ResourceGroup, ResourceRequest, ACTIONS_GROUP};
use crate::error::{GorchError, Result};

pub type HandleId = Uuid;

/// A granted request: every group in `request` holds `count` permits for it.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceHandle {
    pub id: HandleId,
    pub request: ResourceRequest,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    groups: BTreeMap<String, ResourceGroup>,
    handles: HashMap<HandleId, ResourceHandle>,
}

/// Admission controller over a fixed set of resource groups.
///
/// The group table and the active-handle table share one mutex, held only for
/// the duration of a single acquire or release; nothing here ever waits for
/// capacity.
#[derive(Debug, Default)]
pub struct ResourceManager {
    tables: Mutex<Tables>,
}

impl ResourceManager {
    pub fn new<I, K>(capacities: I) -> Self
    where
        I: IntoIterator<Item = (K, i64)>,
        K: Into<String>,
    {
        let groups = capacities
            .into_iter()
            .map(|(name, capacity)| {
                let name = name.into();
                (name.clone(), ResourceGroup::new(name, capacity))
            })
            .collect();
        Self {
            tables: Mutex::new(Tables {
                groups,
                handles: HashMap::new(),
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire every `(group, count)` in `request`, or nothing at all.
    ///
    /// Groups are tried in the request's name order. On the first refusal the
    /// groups already granted for this request are released again before the
    /// error is returned.
    pub fn try_acquire_request(&self, request: &ResourceRequest) -> Result<HandleId> {
        let mut tables = self.tables();

        for (name, count) in request.iter() {
            if count < 0 {
                return Err(GorchError::InvalidResourceCount {
                    name: name.to_string(),
                    count,
                });
            }
            if !tables.groups.contains_key(name) {
                return Err(GorchError::UnknownResourceGroup(name.to_string()));
            }
        }

        let mut granted: Vec<(&str, i64)> = Vec::with_capacity(request.len());
        let mut refused: Option<(&str, i64)> = None;
        for (name, count) in request.iter() {
            let Some(group) = tables.groups.get_mut(name) else {
                refused = Some((name, 0));
                break;
            };
            if group.try_acquire(count) {
                granted.push((name, count));
            } else {
                refused = Some((name, group.capacity()));
                break;
            }
        }

        if let Some((name, capacity)) = refused {
            for (done, count) in granted {
                if let Some(group) = tables.groups.get_mut(done) {
                    group.release(count);
                }
            }
            debug!(group = name, "resource request refused");
            if name == ACTIONS_GROUP {
                return Err(GorchError::ActionsBusy(capacity));
            }
            return Err(GorchError::InsufficientResources(name.to_string()));
        }

        let handle = ResourceHandle {
            id: Uuid::new_v4(),
            request: request.clone(),
            created: Utc::now(),
        };
        let id = handle.id;
        tables.handles.insert(id, handle);
        debug!(handle = %id, "resource request granted");
        Ok(id)
    }

    /// Release the handle and everything it holds. Unknown ids are ignored.
    ///
    /// Returns whether a handle was actually released.
    pub fn release_handle(&self, id: &HandleId) -> bool {
        let mut tables = self.tables();
        let Some(handle) = tables.handles.remove(id) else {
            return false;
        };
        for (name, count) in handle.request.iter() {
            if let Some(group) = tables.groups.get_mut(name) {
                group.release(count);
            }
        }
        debug!(handle = %id, "resource handle released");
        true
    }

    /// Acquire `request` and tie its release to the returned guard.
    pub fn lease(self: &Arc<Self>, request: &ResourceRequest) -> Result<Lease> {
        let id = self.try_acquire_request(request)?;
        Ok(Lease {
            manager: Arc::clone(self),
            id: Some(id),
        })
    }

    /// Single-group non-blocking acquire, outside of any handle.
    pub fn try_acquire(&self, name: &str, n: i64) -> Result<bool> {
        let mut tables = self.tables();
        let group = tables
            .groups
            .get_mut(name)
            .ok_or_else(|| GorchError::UnknownResourceGroup(name.to_string()))?;
        Ok(group.try_acquire(n))
    }

    /// Single-group release, the counterpart of [`try_acquire`](Self::try_acquire).
    pub fn release(&self, name: &str, n: i64) -> Result<()> {
        let mut tables = self.tables();
        let group = tables
            .groups
            .get_mut(name)
            .ok_or_else(|| GorchError::UnknownResourceGroup(name.to_string()))?;
        group.release(n);
        Ok(())
    }

    pub fn count(&self, name: &str) -> Option<i64> {
        self.tables().groups.get(name).map(ResourceGroup::capacity)
    }

    pub fn held(&self, name: &str) -> Option<i64> {
        self.tables().groups.get(name).map(ResourceGroup::held)
    }

    pub fn groups(&self) -> Vec<GroupStatus> {
        self.tables()
            .groups
            .values()
            .map(ResourceGroup::status)
            .collect()
    }

    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.tables().handles.values().cloned().collect()
    }

    pub fn active_handles(&self) -> usize {
        self.tables().handles.len()
    }
}

/// Scoped ownership of a resource handle; dropping it releases the handle.
#[derive(Debug)]
pub struct Lease {
    manager: Arc<ResourceManager>,
    id: Option<HandleId>,
}

impl Lease {
    pub fn id(&self) -> Option<HandleId> {
        self.id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(id) = self.id.take() {
            self.manager.release_handle(&id);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager() -> ResourceManager {
        ResourceManager::new([("slots", 2), ("gpu", 1), (ACTIONS_GROUP, 3)])
    }

    #[test]
    fn grant_increases_held_by_exact_counts() {
        let rm = manager();
        let req = ResourceRequest::new().with("slots", 2).with("gpu", 1);
        let id = rm.try_acquire_request(&req).unwrap();
        assert_eq!(rm.held("slots"), Some(2));
        assert_eq!(rm.held("gpu"), Some(1));
        assert_eq!(rm.active_handles(), 1);
        assert!(rm.release_handle(&id));
        assert_eq!(rm.held("slots"), Some(0));
        assert_eq!(rm.held("gpu"), Some(0));
    }

    #[test]
    fn refusal_rolls_back_partial_grants() {
        let rm = manager();
        let _gpu = rm
            .try_acquire_request(&ResourceRequest::new().with("gpu", 1))
            .unwrap();

        // "actions" and "gpu" sort before "slots"; gpu is exhausted.
        let req = ResourceRequest::new()
            .with(ACTIONS_GROUP, 1)
            .with("gpu", 1)
            .with("slots", 1);
        let err = rm.try_acquire_request(&req).unwrap_err();
        assert!(matches!(err, GorchError::InsufficientResources(ref g) if g == "gpu"));
        assert!(err.is_admission_rejected());
        assert_eq!(rm.held(ACTIONS_GROUP), Some(0));
        assert_eq!(rm.held("slots"), Some(0));
        assert_eq!(rm.held("gpu"), Some(1));
        assert_eq!(rm.active_handles(), 1);
    }

    #[test]
    fn exhausted_actions_group_reports_busy_count() {
        let rm = manager();
        let req = ResourceRequest::new().with(ACTIONS_GROUP, 1);
        for _ in 0..3 {
            rm.try_acquire_request(&req).unwrap();
        }
        let err = rm.try_acquire_request(&req).unwrap_err();
        assert!(matches!(err, GorchError::ActionsBusy(3)));
        assert_eq!(err.to_string(), "3 actions already running");
    }

    #[test]
    fn unknown_group_fails_without_side_effects() {
        let rm = manager();
        let req = ResourceRequest::new().with("slots", 1).with("tpu", 1);
        let err = rm.try_acquire_request(&req).unwrap_err();
        assert!(matches!(err, GorchError::UnknownResourceGroup(ref g) if g == "tpu"));
        assert_eq!(rm.held("slots"), Some(0));
    }

    #[test]
    fn negative_count_is_rejected() {
        let rm = manager();
        let err = rm
            .try_acquire_request(&ResourceRequest::new().with("slots", -1))
            .unwrap_err();
        assert!(matches!(err, GorchError::InvalidResourceCount { .. }));
    }

    #[test]
    fn double_release_is_a_no_op() {
        let rm = manager();
        let a = rm
            .try_acquire_request(&ResourceRequest::new().with("slots", 1))
            .unwrap();
        let _b = rm
            .try_acquire_request(&ResourceRequest::new().with("slots", 1))
            .unwrap();
        assert!(rm.release_handle(&a));
        assert!(!rm.release_handle(&a));
        assert_eq!(rm.held("slots"), Some(1));
        assert!(!rm.release_handle(&Uuid::new_v4()));
    }

    #[test]
    fn empty_request_always_succeeds() {
        let rm = manager();
        let id = rm.try_acquire_request(&ResourceRequest::new()).unwrap();
        assert!(rm.release_handle(&id));
    }

    #[test]
    fn lease_releases_on_drop() {
        let rm = Arc::new(manager());
        {
            let lease = rm.lease(&ResourceRequest::new().with("gpu", 1)).unwrap();
            assert!(lease.id().is_some());
            assert_eq!(rm.held("gpu"), Some(1));
        }
        assert_eq!(rm.held("gpu"), Some(0));
        assert_eq!(rm.active_handles(), 0);
    }

    #[test]
    fn lease_releases_when_holder_panics() {
        let rm = Arc::new(manager());
        let rm2 = Arc::clone(&rm);
        let result = std::thread::spawn(move || {
            let _lease = rm2.lease(&ResourceRequest::new().with("slots", 2)).unwrap();
            panic!("action blew up");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(rm.held("slots"), Some(0));
    }

    #[test]
    fn single_group_acquire_and_release() {
        let rm = manager();
        assert!(rm.try_acquire("gpu", 1).unwrap());
        assert!(!rm.try_acquire("gpu", 1).unwrap());
        rm.release("gpu", 1).unwrap();
        assert_eq!(rm.held("gpu"), Some(0));
        assert!(rm.try_acquire("nope", 1).is_err());
        assert_eq!(rm.count("gpu"), Some(1));
        assert_eq!(rm.count("nope"), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(i64, i64),
        ReleaseOldest,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..4, 0i64..3).prop_map(|(s, g)| Op::Acquire(s, g)),
            Just(Op::ReleaseOldest),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn held_stays_within_bounds_under_concurrency(
            workers in proptest::collection::vec(proptest::collection::vec(op(), 1..40), 1..6)
        ) {
            let rm = Arc::new(ResourceManager::new([("slots", 4), ("gpu", 2)]));
            let threads: Vec<_> = workers
                .into_iter()
                .map(|ops| {
                    let rm = Arc::clone(&rm);
                    std::thread::spawn(move || {
                        let mut mine = std::collections::VecDeque::new();
                        for op in ops {
                            match op {
                                Op::Acquire(s, g) => {
                                    let req = ResourceRequest::new().with("slots", s).with("gpu", g);
                                    if let Ok(id) = rm.try_acquire_request(&req) {
                                        mine.push_back(id);
                                    }
                                }
                                Op::ReleaseOldest => {
                                    if let Some(id) = mine.pop_front() {
                                        rm.release_handle(&id);
                                    }
                                }
                            }
                            for g in rm.groups() {
                                assert!(g.held >= 0 && g.held <= g.capacity, "{g:?}");
                            }
                        }
                        mine
                    })
                })
                .collect();

            let mut leftover = Vec::new();
            for t in threads {
                leftover.extend(t.join().unwrap());
            }
            for id in &leftover {
                prop_assert!(rm.release_handle(id));
                prop_assert!(!rm.release_handle(id));
            }
            prop_assert_eq!(rm.held("slots"), Some(0));
            prop_assert_eq!(rm.held("gpu"), Some(0));
            prop_assert_eq!(rm.active_handles(), 0);
        }
    }
}
