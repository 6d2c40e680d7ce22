#![no_main]

use std::collections::HashSet;

use libfuzzer_sys::fuzz_target;

use strata_memory::{Arena, Pool};
use strata_vm::HeapVm;

static SMALL_PAGES: HeapVm = HeapVm::with_page_size(256);

fuzz_target!(|data: &[u8]| {
    let Some((&slot_size, ops)) = data.split_first() else {
        return;
    };
    let slot_size = usize::from(slot_size % 64).max(8);
    let Ok(mut arena) = Arena::try_with_provider(1 << 20, &SMALL_PAGES) else {
        return;
    };
    let mut pool = Pool::new(slot_size, &mut arena);
    let mut live = Vec::new();
    let mut dead = Vec::new();

    for &op in ops {
        match op % 4 {
            0 | 1 => {
                let Ok(handle) = pool.try_alloc() else {
                    break;
                };
                assert!(pool.payload(handle).iter().all(|&b| b == 0));
                pool.write(handle, handle.index() as u64);
                live.push(handle);
            }
            2 if !live.is_empty() => {
                let handle = live.swap_remove(usize::from(op) % live.len());
                assert!(pool.free(handle));
                dead.push(handle);
            }
            _ => {
                if let Some(&handle) = dead.last() {
                    assert!(!pool.free(handle));
                }
            }
        }
    }

    assert_eq!(pool.live_count(), live.len());
    let seen: HashSet<_> = pool.handles().collect();
    assert_eq!(seen, live.iter().copied().collect::<HashSet<_>>());
    for &handle in &live {
        assert_eq!(pool.read::<u64>(handle), Some(handle.index() as u64));
    }
    for handle in dead {
        assert!(!pool.is_valid(handle));
    }
});
