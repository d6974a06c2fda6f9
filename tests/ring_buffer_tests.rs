use std::sync::Arc;
use std::thread;
use std::time::Duration;
use usp_client::ring_buffer::{BlockingRingBuffer, RingBuffer, RingBufferError};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[test]
fn test_basic_fill_and_drain() {
    let rb = RingBuffer::new();
    rb.set_name("basic fill and drain").unwrap();
    rb.set_size(1024).unwrap();
    assert_eq!(rb.name().unwrap(), "basic fill and drain");
    assert_eq!(rb.size().unwrap(), 1024);
    assert_eq!(rb.write_pos().unwrap(), 0);
    assert_eq!(rb.read_pos().unwrap(), 0);

    let data = pattern(512);
    rb.write(&data).unwrap();
    assert_eq!(rb.write_pos().unwrap(), 512);
    assert_eq!(rb.read_pos().unwrap(), 0);

    // Strict read wants all 1024 bytes or nothing
    let mut dst = vec![0u8; 1024];
    assert_eq!(
        rb.read(&mut dst),
        Err(RingBufferError::NotEnoughData {
            requested: 1024,
            available: 512
        })
    );

    let mut dst = vec![0u8; 512];
    rb.read(&mut dst).unwrap();
    assert_eq!(dst, data);
    assert_eq!(rb.write_pos().unwrap(), 512);
    assert_eq!(rb.read_pos().unwrap(), 512);
}

#[test]
fn test_strict_under_read_has_no_side_effects() {
    let rb = RingBuffer::new();
    rb.set_size(1024).unwrap();

    let mut dst = [0u8; 1];
    assert!(rb.read(&mut dst).is_err());
    assert_eq!(rb.read_pos().unwrap(), 0);
    assert_eq!(rb.write_pos().unwrap(), 0);
}

#[test]
fn test_half_full_rejects_oversized_io() {
    let size = 1024;
    let rb = RingBuffer::new();
    rb.set_size(size).unwrap();
    let data = pattern(size);

    rb.write(&data[..size / 2]).unwrap();

    let mut dst = vec![0u8; size];
    assert!(rb.read(&mut dst).is_err()); // not that much available
    assert_eq!(
        rb.write(&data),
        Err(RingBufferError::NotEnoughSpace {
            requested: size,
            free: (size / 2) as u64
        })
    );

    // Neither failure moved a position
    assert_eq!(rb.write_pos().unwrap(), (size / 2) as u64);
    assert_eq!(rb.read_pos().unwrap(), 0);
}

#[test]
fn test_read_all_of_it_in_parts() {
    let size = 1024;
    let rb = RingBuffer::new();
    rb.set_size(size).unwrap();
    let data = pattern(size);
    rb.write(&data[..size / 2]).unwrap();

    let mut read = vec![0u8; size];

    let first = 10;
    rb.read(&mut read[..first]).unwrap();
    assert_eq!(rb.read_pos().unwrap(), first as u64);

    // The counted form takes what is left
    let got = rb.read_some(&mut read[first..]).unwrap();
    assert_eq!(first + got, size / 2);
    assert_eq!(&read[..size / 2], &data[..size / 2]);
    assert_eq!(rb.read_pos().unwrap(), (size / 2) as u64);

    let mut dst = [0u8; 1];
    assert!(rb.read(&mut dst).is_err()); // nothing left, not even one byte
}

#[test]
fn test_overflow_ring() {
    let size = 1024usize;
    let rb = RingBuffer::new();
    rb.set_name("overflow allowed").unwrap();
    rb.set_size(size).unwrap();
    rb.allow_overflow(true).unwrap();

    let data = pattern(size);
    rb.write(&data).unwrap();
    assert_eq!(rb.write_pos().unwrap(), 1024);
    assert_eq!(rb.read_pos().unwrap(), 0);

    // Positional read of everything, read_pos untouched
    let mut full = vec![0u8; size];
    rb.read_at(0, &mut full).unwrap();
    assert_eq!(full, data);
    assert_eq!(rb.read_pos().unwrap(), 0);

    // One more byte rolls the oldest byte off
    rb.write(&[0xEF]).unwrap();
    assert_eq!(rb.write_pos().unwrap(), 1025);
    assert_eq!(rb.read_pos().unwrap(), 1);

    let mut one = [0u8; 1];
    rb.read_at(1024, &mut one).unwrap();
    assert_eq!(one[0], 0xEF);

    let mut two = [0u8; 2];
    assert_eq!(
        rb.read_at(1024, &mut two),
        Err(RingBufferError::NotEnoughData {
            requested: 2,
            available: 1
        })
    );

    // Position 0 was discarded by the overflow write
    assert_eq!(
        rb.read_at(0, &mut one),
        Err(RingBufferError::DataOverwritten(0))
    );

    // Everything from the current read position is still intact
    let mut window = vec![0u8; size];
    rb.read_at(rb.read_pos().unwrap(), &mut window).unwrap();
    assert_eq!(&window[..1023], &data[1..]);
    assert_eq!(window[1023], 0xEF);
}

#[test]
fn test_init_pos_shifts_the_address_space() {
    let rb = RingBuffer::new();
    rb.set_size(1025).unwrap();
    rb.set_init_pos(7).unwrap();
    assert_eq!(rb.init_pos().unwrap(), 7);
    assert_eq!(rb.read_pos().unwrap(), 7);
    assert_eq!(rb.write_pos().unwrap(), 7);

    // Lots of data, one byte at a time, straddling many wrap points
    let data = pattern(1024);
    for i in 0..(1024 + 37) {
        let byte = [data[i % 1024]];
        rb.write(&byte).unwrap();
        assert_eq!(rb.write_pos().unwrap(), rb.read_pos().unwrap() + 1);

        let mut read = [0u8; 1];
        rb.read(&mut read).unwrap();
        assert_eq!(rb.read_pos().unwrap(), rb.write_pos().unwrap());
        assert_eq!(read[0], byte[0]);
    }
}

#[test]
fn test_round_trip_in_quarters() {
    let size = 1025;
    let rb = RingBuffer::new();
    rb.set_size(size).unwrap();
    rb.set_init_pos(7).unwrap();

    let data = pattern(1024);
    let parts = 4;
    let part = 1024 / parts;

    for i in 0..(3 * parts) {
        let src = &data[part * (i % parts)..part * (i % parts) + part];
        rb.write(src).unwrap();

        let shared = rb.read_shared(part).unwrap();
        assert_eq!(rb.read_pos().unwrap(), rb.write_pos().unwrap());
        assert_eq!(&shared[..], src);
    }

    // The last full kilobyte is still addressable by absolute position
    let tail = rb
        .read_shared_at(rb.read_pos().unwrap() - 1024, 1024)
        .unwrap();
    assert_eq!(&tail[..], &data[..]);
}

#[test]
fn test_positions_are_monotonic() {
    let rb = RingBuffer::new();
    rb.set_size(64).unwrap();
    rb.allow_overflow(true).unwrap();

    let mut last_read = 0;
    let mut last_write = 0;
    for round in 0..200 {
        rb.write(&pattern(7)).unwrap();
        if round % 3 == 0 {
            let mut buf = [0u8; 5];
            let _ = rb.read_some(&mut buf);
        }

        let read_pos = rb.read_pos().unwrap();
        let write_pos = rb.write_pos().unwrap();
        assert!(read_pos >= last_read);
        assert!(write_pos >= last_write);
        assert!(read_pos <= write_pos);
        assert!(write_pos - read_pos <= 64);
        last_read = read_pos;
        last_write = write_pos;
    }
}

#[test]
fn test_term_fails_getters_and_io() {
    let rb = RingBuffer::new();
    rb.set_size(1024).unwrap();
    rb.write(&pattern(8)).unwrap();

    rb.term();
    assert_eq!(rb.size(), Err(RingBufferError::Terminated));
    assert_eq!(rb.write(&[1]), Err(RingBufferError::Terminated));
    assert_eq!(rb.read_shared(1), Err(RingBufferError::Terminated));
}

#[test]
fn test_blocking_read_waits_for_writer() {
    let size = 1024;
    let rb = Arc::new(BlockingRingBuffer::new());
    rb.set_name("blocking basics").unwrap();
    rb.set_size(size).unwrap();

    let data = pattern(size);
    let writer = {
        let rb = rb.clone();
        let data = data.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            rb.write(&data[..size / 2]).unwrap();
            thread::sleep(Duration::from_millis(50));
            rb.write(&data[size / 2..]).unwrap();
        })
    };

    let mut read = vec![0u8; size];
    rb.read(&mut read).unwrap();
    assert_eq!(read, data);
    writer.join().unwrap();
}

#[test]
fn test_blocking_positional_read_waits_too() {
    let size = 1024;
    let rb = Arc::new(BlockingRingBuffer::new());
    rb.set_size(size).unwrap();

    let data = pattern(size);
    let writer = {
        let rb = rb.clone();
        let data = data.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            rb.write(&data).unwrap();
        })
    };

    let mut read = vec![0u8; size];
    let got = rb.read_at_some(0, &mut read).unwrap();
    assert_eq!(got, size);
    assert_eq!(read, data);
    // Positional reads never advance the queue position
    assert_eq!(rb.read_pos().unwrap(), 0);
    writer.join().unwrap();
}

#[test]
fn test_zero_write_unblocks_partial_read() {
    let size = 1024;
    let rb = Arc::new(BlockingRingBuffer::new());
    rb.set_size(size).unwrap();

    let data = pattern(size);
    let writer = {
        let rb = rb.clone();
        let data = data.clone();
        thread::spawn(move || {
            rb.write(&data[..size / 2]).unwrap();
            rb.write(&data[size / 2..]).unwrap();
            thread::sleep(Duration::from_millis(300));
            rb.write(&[]).unwrap(); // unblock the reader
        })
    };

    // Ask for twice what will ever arrive
    let mut read = vec![0u8; size * 2];
    let got = rb.read_at_some(0, &mut read).unwrap();
    assert_eq!(got, size);
    assert_eq!(&read[..size], &data[..]);
    writer.join().unwrap();

    // The pulse is consumed: with the queue drained, the next read blocks
    // again until data shows up
    let mut drain = vec![0u8; size];
    rb.read(&mut drain).unwrap();
    let writer = {
        let rb = rb.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            rb.write(&[42, 43]).unwrap();
        })
    };
    let mut two = [0u8; 2];
    rb.read(&mut two).unwrap();
    assert_eq!(two, [42, 43]);
    writer.join().unwrap();
}

#[test]
fn test_shared_read_not_waiting_for_all_of_it() {
    let size = 1024;
    let rb = Arc::new(BlockingRingBuffer::new());
    rb.set_size(size).unwrap();

    let data = pattern(size);
    let writer = {
        let rb = rb.clone();
        let data = data.clone();
        thread::spawn(move || {
            rb.write(&data[..size / 2]).unwrap();
            rb.write(&data[size / 2..]).unwrap();
            thread::sleep(Duration::from_millis(200));
            rb.unblock().unwrap();
        })
    };

    let shared = rb.read_shared_some(size * 10).unwrap();
    assert_eq!(shared.len(), size);
    assert_eq!(&shared[..], &data[..]);
    writer.join().unwrap();
}

#[test]
fn test_term_wakes_blocked_readers() {
    let rb = Arc::new(BlockingRingBuffer::new());
    rb.set_size(64).unwrap();

    let reader = {
        let rb = rb.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            rb.read(&mut buf)
        })
    };

    thread::sleep(Duration::from_millis(100));
    rb.term();
    assert_eq!(reader.join().unwrap(), Err(RingBufferError::Terminated));
}
