use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::errors::QueueError;
use crate::queue::SlickQueue;

static SEGMENT_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_segment_path(dir: &TempDir) -> String {
    format!(
        "{}/slick-queue-{}-{}.ipc",
        dir.path().display(),
        std::process::id(),
        SEGMENT_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

#[test]
fn opener_adopts_capacity_and_reads_publications() {
    let dir = tempfile::tempdir().unwrap();
    let path = unique_segment_path(&dir);

    let creator = SlickQueue::<i32>::create(4, &path).unwrap();
    assert!(creator.own_buffer());
    assert!(creator.use_shm());

    let opener = SlickQueue::<i32>::open(&path).unwrap();
    assert_eq!(opener.capacity(), 4);
    assert!(!opener.own_buffer());
    assert!(opener.use_shm());

    for value in [5, 12, 23] {
        let reserved = creator.reserve(1).unwrap();
        unsafe { *creator.at(reserved) = value };
        creator.publish(reserved, 1);
    }

    let mut cursor = 0u64;
    for expected in [5, 12, 23] {
        let (data, size) = opener.read(&mut cursor).unwrap();
        assert_eq!(size, 1);
        assert_eq!(unsafe { *data }, expected);
    }
    assert_eq!(cursor, 3);
    assert_eq!(opener.read(&mut cursor), None);
}

#[test]
fn element_size_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = unique_segment_path(&dir);

    let _creator = SlickQueue::<i32>::create(4, &path).unwrap();
    let result = SlickQueue::<i64>::open(&path);
    assert!(matches!(
        result,
        Err(QueueError::ElementSizeMismatch {
            expected: 8,
            found: 4
        })
    ));
}

#[test]
fn capacity_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = unique_segment_path(&dir);

    let _creator = SlickQueue::<i32>::create(4, &path).unwrap();
    let result = SlickQueue::<i32>::create(8, &path);
    assert!(matches!(
        result,
        Err(QueueError::CapacityMismatch {
            requested: 8,
            found: 4
        })
    ));
}

#[test]
fn open_missing_segment_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = unique_segment_path(&dir);
    assert!(matches!(
        SlickQueue::<i32>::open(&path),
        Err(QueueError::ShmMapFailure(_))
    ));
}

#[test]
fn second_create_binds_as_opener() {
    let dir = tempfile::tempdir().unwrap();
    let path = unique_segment_path(&dir);

    let first = SlickQueue::<u64>::create(8, &path).unwrap();
    let second = SlickQueue::<u64>::create(8, &path).unwrap();
    assert!(first.own_buffer());
    assert!(!second.own_buffer());

    let reserved = first.reserve(1).unwrap();
    unsafe { *first.at(reserved) = 7 };
    first.publish(reserved, 1);

    let mut cursor = 0u64;
    let (data, _) = second.read(&mut cursor).unwrap();
    assert_eq!(unsafe { *data }, 7);
}

#[test]
fn late_joiner_starts_at_current_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = unique_segment_path(&dir);

    let creator = SlickQueue::<u64>::create(16, &path).unwrap();
    for value in 0..5u64 {
        let reserved = creator.reserve(1).unwrap();
        unsafe { *creator.at(reserved) = value };
        creator.publish(reserved, 1);
    }

    let opener = SlickQueue::<u64>::open(&path).unwrap();
    assert_eq!(opener.initial_reading_index(), 5);

    // A cursor seeded from it sees only what is published afterwards.
    let mut cursor = opener.initial_reading_index();
    assert_eq!(opener.read(&mut cursor), None);

    let reserved = creator.reserve(1).unwrap();
    unsafe { *creator.at(reserved) = 99 };
    creator.publish(reserved, 1);
    let (data, _) = opener.read(&mut cursor).unwrap();
    assert_eq!(unsafe { *data }, 99);
}

#[test]
fn read_last_is_shared_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = unique_segment_path(&dir);

    let creator = SlickQueue::<i32>::create(4, &path).unwrap();
    let opener = SlickQueue::<i32>::open(&path).unwrap();
    assert_eq!(opener.read_last(), None);

    for value in [7, 9] {
        let reserved = creator.reserve(1).unwrap();
        unsafe { *creator.at(reserved) = value };
        creator.publish(reserved, 1);
    }

    let (data, size) = opener.read_last().unwrap();
    assert_eq!(size, 1);
    assert_eq!(unsafe { *data }, 9);
}

#[test]
fn reset_resyncs_a_stale_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let path = unique_segment_path(&dir);

    let mut creator = SlickQueue::<u64>::create(8, &path).unwrap();
    let opener = SlickQueue::<u64>::open(&path).unwrap();

    for _ in 0..60 {
        let reserved = creator.reserve(1).unwrap();
        unsafe { *creator.at(reserved) = reserved };
        creator.publish(reserved, 1);
    }
    // A reader that stopped mid-stream.
    let mut cursor = 50u64;

    creator.reset();
    for _ in 0..60 {
        let reserved = creator.reserve(1).unwrap();
        unsafe { *creator.at(reserved) = 1000 + reserved };
        creator.publish(reserved, 1);
    }

    // The stale cursor's slot now carries the newest post-reset index on
    // that offset (58); the reader lands there and accounts the skip.
    let (data, size) = opener.read(&mut cursor).unwrap();
    assert_eq!(size, 1);
    assert_eq!(unsafe { *data }, 1058);
    assert_eq!(cursor, 59);
    #[cfg(any(debug_assertions, feature = "loss-detection"))]
    assert_eq!(opener.loss_count(), 8);
}

#[test]
fn live_reader_survives_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = unique_segment_path(&dir);

    let mut creator = SlickQueue::<u64>::create(16, &path).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let path = path.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let opener = SlickQueue::<u64>::open(&path).unwrap();
            let mut cursor = 0u64;
            let mut records = 0u64;
            let mut rewinds = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let before = cursor;
                if opener.read(&mut cursor).is_some() {
                    records += 1;
                }
                if cursor < before {
                    rewinds += 1;
                }
                thread::yield_now();
            }
            (records, rewinds)
        })
    };

    let deadline = Instant::now() + Duration::from_millis(300);
    let mut value = 0u64;
    while Instant::now() < deadline {
        for _ in 0..100 {
            let reserved = creator.reserve(1).unwrap();
            unsafe { *creator.at(reserved) = value };
            creator.publish(reserved, 1);
            value += 1;
        }
        creator.reset();
        value = 0;
    }
    stop.store(true, Ordering::Relaxed);

    let (records, rewinds) = reader.join().unwrap();
    assert!(records > 0, "reader never observed a record");
    // Catching a reset in the act is timing dependent; report it rather
    // than fail the run.
    if rewinds == 0 {
        println!("warning: no cursor rewind observed in this run");
    }
}
