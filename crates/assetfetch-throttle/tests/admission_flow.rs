#![cfg(not(loom))]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use assetfetch_throttle::{
    Admission, DestinationKey, DestinationRegistry, FairnessPolicy, RegistryConfig, RequestClass,
};
use parking_lot::Mutex;
use proptest::prelude::*;

#[derive(Default)]
struct Running {
    requests: Mutex<Vec<(DestinationKey, u32)>>,
}

impl Admission<u32> for Running {
    fn has_capacity(&self) -> bool {
        true
    }

    fn admit(&self, destination: &DestinationKey, _class: RequestClass, request: u32) {
        self.requests.lock().push((destination.clone(), request));
    }
}

fn registry(limit: usize) -> DestinationRegistry<u32> {
    DestinationRegistry::new(RegistryConfig {
        concurrency_per_destination: limit,
        fairness: FairnessPolicy::default(),
    })
}

#[test]
fn third_request_waits_for_a_free_slot() {
    let reg = registry(2);
    let running = Running::default();
    let key = DestinationKey::from_locator("http://x.example.com:80/asset");
    let mut handles = Vec::new();

    for id in 1..=3u32 {
        let handle = reg.get_or_create(&key);
        {
            let mut q = handle.lock();
            if q.admit() {
                q.mark_admitted(RequestClass::Texture);
                running.admit(&key, RequestClass::Texture, id);
            } else {
                q.enqueue(id, RequestClass::Texture);
            }
        }
        handles.push(handle);
    }

    assert_eq!(running.requests.lock().len(), 2);
    assert_eq!(reg.total_queued(), 1);
    reg.take_flags();

    // First request completes.
    let done = handles.remove(0);
    done.lock().mark_released(RequestClass::Texture, false);
    assert!(reg.add_queued_to(&done, &running));
    reg.release(done);

    assert_eq!(reg.total_queued(), 0);
    assert!(reg.take_flags().empty);
    let admitted: Vec<u32> = running.requests.lock().iter().map(|(_, id)| *id).collect();
    assert_eq!(admitted, vec![1, 2, 3]);
    assert_eq!(handles[0].lock().admitted(), 2);

    for handle in handles {
        handle.lock().mark_released(RequestClass::Texture, false);
        reg.release(handle);
    }
    assert!(reg.is_empty());
}

#[test]
fn idle_destination_promotes_siblings() {
    let reg = registry(1);
    let running = Running::default();
    let busy = reg.get_or_create(&DestinationKey::from_locator("busy.example.com"));
    let idle = reg.get_or_create(&DestinationKey::from_locator("idle.example.com"));
    busy.lock().enqueue(9, RequestClass::Mesh);

    assert!(reg.add_queued_to(&idle, &running));
    assert_eq!(running.requests.lock()[0].0.as_str(), "busy.example.com");
    assert_eq!(reg.total_queued(), 0);

    busy.lock().mark_released(RequestClass::Mesh, false);
    reg.release(busy);
    reg.release(idle);
}

#[derive(Debug, Clone)]
enum Op {
    Enqueue(u32),
    Cancel(u32),
    Admit,
    Release,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..16).prop_map(Op::Enqueue),
        (0u32..16).prop_map(Op::Cancel),
        Just(Op::Admit),
        Just(Op::Release),
    ]
}

proptest! {
    #[test]
    fn fifo_and_limit_hold_for_any_sequence(ops in prop::collection::vec(op(), 0..64), limit in 1usize..4) {
        let reg = registry(limit);
        let running = Running::default();
        let handle = reg.get_or_create(&DestinationKey::from_locator("p.example.com"));
        let mut model: VecDeque<u32> = VecDeque::new();
        let mut admitted = 0usize;

        for op in ops {
            match op {
                Op::Enqueue(id) => {
                    handle.lock().enqueue(id, RequestClass::Texture);
                    model.push_back(id);
                }
                Op::Cancel(id) => {
                    let removed = handle.lock().cancel(&id, RequestClass::Texture);
                    let pos = model.iter().position(|r| *r == id);
                    prop_assert_eq!(removed, pos.is_some());
                    if let Some(pos) = pos {
                        model.remove(pos);
                    }
                }
                Op::Admit => {
                    if reg.add_queued_to(&handle, &running) {
                        admitted += 1;
                        let (_, id) = running.requests.lock().last().cloned().expect("admitted");
                        prop_assert_eq!(Some(id), model.pop_front());
                    }
                }
                Op::Release => {
                    if admitted > 0 {
                        handle.lock().mark_released(RequestClass::Texture, false);
                        admitted -= 1;
                    }
                }
            }
            let q = handle.lock();
            prop_assert!(q.admitted() <= q.limit());
            prop_assert_eq!(q.queued(RequestClass::Texture).copied().collect::<Vec<_>>(), model.iter().copied().collect::<Vec<_>>());
            drop(q);
            prop_assert_eq!(reg.total_queued(), model.len());
        }
        reg.purge();
        reg.release(handle);
    }
}

#[test]
fn concurrent_release_never_drops_queued_destinations() {
    for round in 0..20u32 {
        let reg = Arc::new(registry(2));
        let keys: Vec<DestinationKey> = (0..4)
            .map(|i| DestinationKey::from_locator(&format!("h{i}.example.com")))
            .collect();
        let workers: Vec<_> = (0..4u32)
            .map(|t| {
                let reg = Arc::clone(&reg);
                let keys = keys.clone();
                thread::spawn(move || {
                    for i in 0..200u32 {
                        let key = &keys[((i + t + round) % 4) as usize];
                        let handle = reg.get_or_create(key);
                        if (i + t) % 3 == 0 {
                            handle.lock().enqueue(i, RequestClass::Other);
                        }
                        reg.release(handle);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread");
        }

        let expected = (0..4u32)
            .flat_map(|t| (0..200u32).filter(move |i| (i + t) % 3 == 0))
            .count();
        let snapshot = reg.snapshot();
        let queued: usize = snapshot.iter().map(|d| d.queued).sum();
        // Every queued request is still reachable through a registered destination.
        assert_eq!(queued, expected);
        assert_eq!(reg.total_queued(), expected);
        reg.purge();
    }
}
