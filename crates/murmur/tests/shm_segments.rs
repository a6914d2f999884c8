//! Named segments seen from the reader side.

use std::thread;

use murmur::shm::{self, ShmSegment, OWNER_RW};
use murmur::ShmError;
use serial_test::serial;

#[test]
#[serial]
fn test_reader_on_another_thread_sees_writes() {
    let mut segment = ShmSegment::create(3 * shm::page_size(), true, OWNER_RW).unwrap();
    let id = segment.id();
    let ring = segment.as_mut_slice().unwrap();
    for (i, b) in ring.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let reader = thread::spawn(move || {
        let segment = ShmSegment::attach_read_only(id).unwrap();
        assert!(segment.is_read_only());
        assert!(!segment.unlinks_on_release());
        segment
            .as_slice()
            .iter()
            .enumerate()
            .all(|(i, &b)| b == (i % 251) as u8)
    });
    assert!(reader.join().unwrap());

    segment.release();
    assert!(matches!(
        ShmSegment::attach_read_only(id),
        Err(ShmError::NotFound { .. })
    ));
}

#[test]
#[serial]
fn test_reader_outlives_unlink() {
    let mut segment = ShmSegment::create(shm::page_size(), true, OWNER_RW).unwrap();
    segment.as_mut_slice().unwrap()[0] = 0x5a;
    let reader = ShmSegment::attach_read_only(segment.id()).unwrap();

    segment.release();
    assert_eq!(reader.as_slice()[0], 0x5a);
}

#[test]
#[serial]
fn test_sizes_round_trip_through_attach() {
    for size in [1, 100, shm::page_size(), shm::page_size() + 1, 1 << 20] {
        let segment = ShmSegment::create(size, true, OWNER_RW).unwrap();
        let reader = ShmSegment::attach_read_only(segment.id()).unwrap();
        assert_eq!(reader.size(), size);
        drop(reader);
        segment.release();
    }
}

#[test]
#[serial]
fn test_reader_cannot_write() {
    let segment = ShmSegment::create(shm::page_size(), true, OWNER_RW).unwrap();
    let mut reader = ShmSegment::attach_read_only(segment.id()).unwrap();
    assert!(reader.as_mut_slice().is_none());
}

#[test]
#[serial]
fn test_punch_keeps_neighbouring_pages_for_readers() {
    let page = shm::page_size();
    let mut segment = ShmSegment::create(4 * page, true, OWNER_RW).unwrap();
    segment.as_mut_slice().unwrap().fill(0xff);

    segment.punch(page, 2 * page);

    let reader = ShmSegment::attach_read_only(segment.id()).unwrap();
    let data = reader.as_slice();
    assert_eq!(data.len(), 4 * page);
    assert!(data[..page].iter().all(|&b| b == 0xff));
    assert!(data[3 * page..].iter().all(|&b| b == 0xff));
}
