//! Buffer cache behavior over a live driver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MemDisk, BLOCK};
use lv6::{major, DevId, KernelBuilder, Rw};

fn kernel_with(disk: Arc<MemDisk>, nr_buffers: usize) -> Arc<lv6::Kernel> {
    Arc::new(
        KernelBuilder::new()
            .nr_buffers(nr_buffers)
            .driver(major::MEM, disk)
            .build(),
    )
}

#[test]
fn concurrent_getblk_yields_one_header() {
    common::init_tracing();
    let disk = Arc::new(MemDisk::blank(1, 64));
    let kernel = kernel_with(disk, 8);
    let dev = DevId::new(major::MEM, 0);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let k = kernel.clone();
        handles.push(std::thread::spawn(move || {
            let buf = k.getblk(DevId::new(major::MEM, 0), 42);
            let ptr = buf.data().as_ptr() as usize;
            k.brelse(buf);
            ptr
        }));
    }
    let pages: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(pages[0], pages[1], "both tasks must share one data page");

    // Exactly one header ended up keyed (dev, 42).
    let buf = kernel.get_hash_table(dev, 42).expect("block stays cached");
    kernel.brelse(buf);
}

#[test]
fn modified_data_survives_sync_and_invalidate() {
    common::init_tracing();
    let disk = Arc::new(MemDisk::blank(1, 64));
    let kernel = kernel_with(disk.clone(), 8);
    let dev = DevId::new(major::MEM, 0);

    let mut buf = kernel.bread(dev, 11).unwrap();
    buf.data_mut()[7] = 0x5e;
    buf.mark_dirty();
    kernel.brelse(buf);

    kernel.sync_dev(dev);
    kernel.invalidate_buffers(dev);

    let buf = kernel.bread(dev, 11).unwrap();
    assert_eq!(buf.data()[7], 0x5e);
    kernel.brelse(buf);
    assert_eq!(disk.read_byte(0, 11 * BLOCK + 7), 0x5e);
}

#[test]
fn failing_device_read_returns_error_after_retries() {
    common::init_tracing();
    let disk = Arc::new(MemDisk::blank(1, 64));
    disk.poison_sector(0, 10); // block 5, first sector
    let kernel = kernel_with(disk.clone(), 8);
    let dev = DevId::new(major::MEM, 0);

    let before = disk.read_attempts();
    let err = kernel.bread(dev, 5).unwrap_err();
    assert_eq!(err, lv6::Error::Io { dev, block: 5 });
    assert_eq!(disk.read_attempts() - before, 7, "driver retries to its budget");

    // The buffer was released clean and not uptodate; it is reclaimable
    // and a later read starts over.
    let buf = kernel.get_hash_table(dev, 5).expect("header still keyed");
    assert!(!buf.uptodate());
    assert!(!buf.dirty());
    kernel.brelse(buf);
}

#[test]
fn breada_populates_the_readahead_blocks() {
    common::init_tracing();
    let disk = Arc::new(MemDisk::blank(1, 64));
    for block in 20..24u32 {
        disk.write_byte(0, block as usize * BLOCK, block as u8);
    }
    let kernel = kernel_with(disk, 8);
    let dev = DevId::new(major::MEM, 0);

    let buf = kernel.breada(dev, 20, &[21, 22, 23]).unwrap();
    assert_eq!(buf.data()[0], 20);
    kernel.brelse(buf);
    for block in 21..24u32 {
        let cached = kernel.get_hash_table(dev, block).expect("read ahead");
        assert!(cached.uptodate());
        assert_eq!(cached.data()[0], block as u8);
        kernel.brelse(cached);
    }
}

#[test]
fn bread_page_gathers_four_blocks() {
    common::init_tracing();
    let disk = Arc::new(MemDisk::blank(1, 64));
    for (i, block) in [3u32, 9, 27, 40].into_iter().enumerate() {
        disk.write_byte(0, block as usize * BLOCK, 0x10 + i as u8);
    }
    let kernel = kernel_with(disk, 8);
    let dev = DevId::new(major::MEM, 0);

    let mut page = [0u8; 4096];
    kernel.bread_page(&mut page, dev, [3, 9, 27, 40]);
    for i in 0..4 {
        assert_eq!(page[i * BLOCK], 0x10 + i as u8);
    }

    // A zero slot leaves its quarter untouched.
    let mut page = [0xffu8; 4096];
    kernel.bread_page(&mut page, dev, [3, 0, 27, 0]);
    assert_eq!(page[0], 0x10);
    assert_eq!(page[BLOCK], 0xff);
    assert_eq!(page[2 * BLOCK], 0x12);
    assert_eq!(page[3 * BLOCK], 0xff);
}

#[test]
fn page_io_blocks_until_done_and_reports_status() {
    common::init_tracing();
    let disk = Arc::new(MemDisk::blank(1, 64));
    let kernel = kernel_with(disk.clone(), 8);
    let dev = DevId::new(major::MEM, 0);

    let mut page = [0xa5u8; 4096];
    kernel.ll_rw_page(Rw::Write, dev, 3, &mut page).unwrap();
    assert_eq!(disk.read_byte(0, 3 * 4096), 0xa5);

    disk.write_byte(0, 3 * 4096 + 1, 0x42);
    let mut back = [0u8; 4096];
    kernel.ll_rw_page(Rw::Read, dev, 3, &mut back).unwrap();
    assert_eq!(back[0], 0xa5);
    assert_eq!(back[1], 0x42);

    // A page read off a device with no driver is refused.
    let mut out = [0u8; 4096];
    let err = kernel
        .ll_rw_page(Rw::Read, DevId::new(major::HD, 0), 0, &mut out)
        .unwrap_err();
    assert_eq!(err, lv6::Error::NoDevice(DevId::new(major::HD, 0)));
}

#[test]
fn sys_sync_writes_every_dirty_buffer() {
    common::init_tracing();
    let disk = Arc::new(MemDisk::blank(1, 64));
    let kernel = kernel_with(disk.clone(), 8);
    let dev = DevId::new(major::MEM, 0);

    for block in 0..4u32 {
        let mut buf = kernel.bread(dev, block).unwrap();
        buf.data_mut()[0] = 0x80 | block as u8;
        buf.mark_dirty();
        kernel.brelse(buf);
    }
    kernel.sys_sync();
    for block in 0..4u32 {
        assert_eq!(disk.read_byte(0, block as usize * BLOCK), 0x80 | block as u8);
    }
}

#[test]
fn writers_block_on_a_full_pool_while_reads_proceed() {
    common::init_tracing();
    let kernel = Arc::new(
        KernelBuilder::new()
            .nr_buffers(40)
            .driver(major::HD, Arc::new(common::StallDisk))
            .build(),
    );
    let dev = DevId::new(major::HD, 0);

    let mut held = Vec::new();
    for block in 0..21u32 {
        let mut buf = kernel.getblk(dev, block);
        buf.data_mut()[0] = block as u8;
        buf.mark_uptodate();
        buf.mark_dirty();
        kernel.ll_rw_block(Rw::Write, &buf);
        held.push(buf);
    }
    assert_eq!(kernel.with_queue(major::HD, |q| q.queued().len()), 21);

    // The 22nd write has no slot and must sleep on wait_for_request.
    let sleeper = {
        let k = kernel.clone();
        std::thread::spawn(move || {
            let dev = DevId::new(major::HD, 0);
            let mut buf = k.getblk(dev, 30);
            buf.data_mut()[0] = 30;
            buf.mark_uptodate();
            buf.mark_dirty();
            k.ll_rw_block(Rw::Write, &buf);
            k.brelse(buf); // waits until the write completes
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!sleeper.is_finished(), "write must wait for a free slot");
    assert_eq!(kernel.with_queue(major::HD, |q| q.queued().len()), 21);

    // A read is admitted into the reserved last third meanwhile.
    let rd = kernel.getblk(dev, 90);
    kernel.ll_rw_block(Rw::Read, &rd);
    assert_eq!(kernel.with_queue(major::HD, |q| q.queued().len()), 22);

    // Draining frees slots; the sleeping writer gets in and finishes.
    while !sleeper.is_finished() {
        kernel.with_queue(major::HD, |q| {
            while q.current_dev().is_some() {
                q.end_request(true);
            }
        });
        std::thread::sleep(Duration::from_millis(5));
    }
    sleeper.join().unwrap();
    kernel.with_queue(major::HD, |q| {
        while q.current_dev().is_some() {
            q.end_request(true);
        }
    });
    for buf in held {
        kernel.brelse(buf);
    }
    kernel.brelse(rd);
}
