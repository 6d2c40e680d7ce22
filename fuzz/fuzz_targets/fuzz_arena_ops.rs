#![no_main]

use libfuzzer_sys::fuzz_target;

use strata_memory::Arena;
use strata_vm::HeapVm;

static SMALL_PAGES: HeapVm = HeapVm::with_page_size(256);

const CAPACITY: usize = 1 << 16;

fuzz_target!(|data: &[u8]| {
    let Ok(mut arena) = Arena::try_with_provider(CAPACITY, &SMALL_PAGES) else {
        return;
    };
    // Live allocations as (offset, size, fill byte), in push order.
    let mut blocks: Vec<(usize, usize, u8)> = Vec::new();
    let mut checkpoints = Vec::new();

    for chunk in data.chunks_exact(3) {
        let size = usize::from(u16::from_le_bytes([chunk[1], chunk[2]])) % 3000;
        match chunk[0] % 5 {
            0 => {
                // Over-capacity pushes must fail cleanly.
                let Ok(offset) = arena.try_push(size) else {
                    assert!(arena.pos() + size > arena.capacity());
                    continue;
                };
                arena.bytes_mut(offset, size).fill(chunk[1]);
                blocks.push((offset, size, chunk[1]));
            }
            1 => {
                if let Some((_, size, _)) = blocks.pop() {
                    arena.pop(size);
                    checkpoints.retain(|(checkpoint, _)| checkpoint.position() <= arena.pos());
                }
            }
            2 => checkpoints.push((arena.checkpoint(), blocks.len())),
            3 => {
                if let Some((checkpoint, len)) = checkpoints.pop() {
                    arena.restore(checkpoint);
                    blocks.truncate(len);
                }
            }
            _ => {
                arena.clear();
                blocks.clear();
                checkpoints.clear();
            }
        }
        assert!(arena.committed() >= arena.pos());
        for &(offset, size, fill) in &blocks {
            assert!(arena.bytes(offset, size).iter().all(|&b| b == fill));
        }
    }
});
