//! End-to-end batching behavior against a live event loop.

use std::cell::RefCell;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use logbatch::{BatchConfig, LineBatchParser};
use reactor::{EventLoop, RunMode, RunOutcome};

fn parser_over_socket(config: BatchConfig) -> (UnixStream, LineBatchParser) {
    let (tx, rx) = UnixStream::pair().unwrap();
    rx.set_nonblocking(true).unwrap();
    (tx, LineBatchParser::new(rx, config))
}

fn capture_batches(parser: &LineBatchParser) -> Rc<RefCell<Vec<Vec<u8>>>> {
    let batches = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&batches);
    parser.set_on_flush(move |batch| sink.borrow_mut().push(batch.to_vec()));
    batches
}

#[test]
fn eof_flushes_complete_lines_and_drops_the_tail() {
    let (mut tx, parser) = parser_over_socket(BatchConfig {
        flush_size: 100,
        inactivity_timeout: None,
    });
    let batches = capture_batches(&parser);
    let mut el = EventLoop::new().unwrap();
    parser.bind(&mut el).unwrap();

    tx.write_all(b"a\nb\nc").unwrap();
    drop(tx);
    assert_eq!(el.run(RunMode::UntilIdle).unwrap(), RunOutcome::Completed);

    assert_eq!(batches.borrow().as_slice(), &[b"a\nb\n".to_vec()]);
    assert!(parser.is_complete());
    // the unterminated "c" is never delivered
    assert_eq!(parser.buffered(), 1);
}

#[test]
fn oversized_run_without_newlines_never_flushes() {
    let (mut tx, parser) = parser_over_socket(BatchConfig {
        flush_size: 65536,
        inactivity_timeout: None,
    });
    let batches = capture_batches(&parser);
    let mut el = EventLoop::new().unwrap();
    parser.bind(&mut el).unwrap();

    let payload = vec![b'x'; 70000];
    tx.write_all(&payload).unwrap();
    drop(tx);
    assert_eq!(el.run(RunMode::UntilIdle).unwrap(), RunOutcome::Completed);

    assert!(batches.borrow().is_empty());
    assert_eq!(parser.buffered(), 70000);
    assert!(parser.is_complete());
}

#[test]
fn threshold_flush_happens_before_the_read_returns() {
    let (mut tx, parser) = parser_over_socket(BatchConfig {
        flush_size: 8,
        inactivity_timeout: None,
    });
    let batches = capture_batches(&parser);
    let mut el = EventLoop::new().unwrap();
    parser.bind(&mut el).unwrap();

    // no EOF and no timeout: only the size threshold can flush here
    tx.write_all(b"aaaa\nbbbb\nrest").unwrap();
    assert_eq!(el.run(RunMode::Once).unwrap(), RunOutcome::Completed);

    assert_eq!(batches.borrow().as_slice(), &[b"aaaa\nbbbb\n".to_vec()]);
    assert_eq!(parser.buffered(), 4);
    assert!(!parser.is_complete());
}

#[test]
fn inactivity_timeout_flushes_and_keeps_the_watch_alive() {
    let (mut tx, parser) = parser_over_socket(BatchConfig {
        flush_size: 1024,
        inactivity_timeout: Some(Duration::from_millis(30)),
    });
    let mut el = EventLoop::new().unwrap();

    let batches = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&batches);
    let ctl = el.ctl();
    parser.set_on_flush(move |batch| {
        sink.borrow_mut().push(batch.to_vec());
        ctl.stop_when_drained(None);
    });
    parser.bind(&mut el).unwrap();

    tx.write_all(b"line1\n").unwrap();
    assert_eq!(el.run(RunMode::UntilIdle).unwrap(), RunOutcome::Completed);
    assert_eq!(batches.borrow().as_slice(), &[b"line1\n".to_vec()]);
    assert!(parser.stream().borrow().is_enabled());

    // a read after the timeout still produces callbacks
    tx.write_all(b"line2\n").unwrap();
    drop(tx);
    assert_eq!(el.run(RunMode::UntilIdle).unwrap(), RunOutcome::Completed);
    assert_eq!(
        batches.borrow().as_slice(),
        &[b"line1\n".to_vec(), b"line2\n".to_vec()]
    );
    assert!(parser.is_complete());
}

#[test]
fn quiet_timeout_with_no_complete_line_delivers_nothing() {
    let (mut tx, parser) = parser_over_socket(BatchConfig {
        flush_size: 1024,
        inactivity_timeout: Some(Duration::from_millis(20)),
    });
    let batches = capture_batches(&parser);
    let mut el = EventLoop::new().unwrap();
    parser.bind(&mut el).unwrap();

    tx.write_all(b"half a line").unwrap();
    el.stop_when_drained(Some(Duration::from_millis(60)));
    assert_eq!(el.run(RunMode::UntilIdle).unwrap(), RunOutcome::Completed);

    assert!(batches.borrow().is_empty());
    assert_eq!(parser.buffered(), 11);
}

#[test]
fn manual_flush_delivers_accumulated_lines() {
    let (mut tx, parser) = parser_over_socket(BatchConfig::default());
    let batches = capture_batches(&parser);
    let mut el = EventLoop::new().unwrap();
    parser.bind(&mut el).unwrap();

    tx.write_all(b"one\ntwo\nthr").unwrap();
    assert_eq!(el.run(RunMode::Once).unwrap(), RunOutcome::Completed);
    assert!(batches.borrow().is_empty());

    parser.flush();
    assert_eq!(batches.borrow().as_slice(), &[b"one\ntwo\n".to_vec()]);
    assert_eq!(parser.buffered(), 3);
}

#[test]
fn free_is_idempotent_and_stops_delivery() {
    let (mut tx, parser) = parser_over_socket(BatchConfig::default());
    let batches = capture_batches(&parser);
    let mut el = EventLoop::new().unwrap();
    parser.bind(&mut el).unwrap();

    parser.free();
    parser.free();

    tx.write_all(b"too late\n").unwrap();
    assert_eq!(el.run(RunMode::UntilIdle).unwrap(), RunOutcome::Completed);
    assert!(batches.borrow().is_empty());
}

#[test]
fn binding_twice_is_rejected() {
    let (_tx, parser) = parser_over_socket(BatchConfig::default());
    let mut el = EventLoop::new().unwrap();
    parser.bind(&mut el).unwrap();
    assert!(parser.bind(&mut el).is_err());
}
