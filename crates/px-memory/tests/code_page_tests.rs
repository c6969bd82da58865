//! Code page tracking through the bus under load

use px_memory::{constants::*, Bus, PageState};
use std::sync::Arc;
use std::thread;

fn bus() -> Bus {
    Bus::new(&vec![0u8; BIOS_SIZE as usize]).unwrap()
}

#[test]
fn test_only_code_pages_become_dirty() {
    let mut bus = bus();
    for page in (0..RAM_CODE_PAGE_COUNT).step_by(2) {
        bus.set_ram_code_page(page);
    }

    for page in 0..RAM_CODE_PAGE_COUNT as u32 {
        bus.write_u32(page * RAM_CODE_PAGE_SIZE + 0x10, page).unwrap();
    }

    let mut dirty = Vec::new();
    bus.ram().take_dirty_pages(&mut dirty);
    assert_eq!(dirty.len(), RAM_CODE_PAGE_COUNT / 2);
    assert!(dirty.iter().all(|page| page % 2 == 0));

    for page in 0..RAM_CODE_PAGE_COUNT as u32 {
        assert_eq!(bus.read_u32(page * RAM_CODE_PAGE_SIZE + 0x10).unwrap(), page);
    }
}

#[test]
fn test_mirror_write_hits_same_code_page() {
    let mut bus = bus();
    bus.set_ram_code_page(0x10);
    bus.write_u16(0x0061_0000, 0xBEEF).unwrap();
    assert!(!bus.is_ram_code_page(0x10));
    assert!(bus
        .ram()
        .page_state(0x10)
        .contains(PageState::DIRTY));
}

#[test]
fn test_clear_code_page_flags() {
    let bus = bus();
    for page in 0..16 {
        bus.set_ram_code_page(page);
    }
    bus.clear_ram_code_page_flags();
    assert!((0..16).all(|page| !bus.is_ram_code_page(page)));
    assert!(!bus.ram().has_dirty_pages());
}

#[test]
fn test_concurrent_dirty_marking() {
    let bus = bus();
    let ram = Arc::clone(bus.ram());
    for page in 0..RAM_CODE_PAGE_COUNT {
        ram.set_code_page(page);
    }

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let ram = Arc::clone(&ram);
            thread::spawn(move || {
                for page in (t..RAM_CODE_PAGE_COUNT).step_by(4) {
                    ram.notify_code_write(page);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let mut dirty = Vec::new();
    ram.take_dirty_pages(&mut dirty);
    assert_eq!(dirty.len(), RAM_CODE_PAGE_COUNT);
}
