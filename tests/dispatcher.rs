//! End-to-end dispatcher behaviour over the in-process loopback backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use macaddr::MacAddr6;
use rawlink::capture::{LoopbackFactory, LoopbackHandle};
use rawlink::{compile_filter, Config, DispatchError, Dispatcher, FrameCallback, Stats};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> Config {
    Config {
        poll_interval: Duration::from_millis(20),
        ..Config::default()
    }
}

fn setup(names: &[&str], reject_runts: bool) -> (Dispatcher, Vec<LoopbackHandle>) {
    let factory = LoopbackFactory::new().reject_runts(reject_runts);
    let handles = names
        .iter()
        .enumerate()
        .map(|(i, name)| factory.add_interface(name, MacAddr6::new(2, 0, 0, 0, 0, i as u8 + 1)))
        .collect();
    let dispatcher = Dispatcher::with_factory(Arc::new(factory), config()).unwrap();
    (dispatcher, handles)
}

/// Callback that forwards every frame into a channel.
fn channel_callback() -> (FrameCallback, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let callback: FrameCallback = Arc::new(move |frame: &[u8]| {
        let _ = tx.lock().unwrap().send(frame.to_vec());
    });
    (callback, rx)
}

fn ignore() -> FrameCallback {
    Arc::new(|_frame: &[u8]| {})
}

fn wait_for_stats(dispatcher: &Dispatcher, name: &str, done: impl Fn(&Stats) -> bool) -> Stats {
    let deadline = Instant::now() + WAIT;
    loop {
        let stats = dispatcher.statistics(name).expect("interface is open");
        if done(&stats) || Instant::now() > deadline {
            return stats;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn frame_starting_with(prefix: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 60];
    frame[..prefix.len()].copy_from_slice(prefix);
    frame
}

#[test]
fn test_filter_delivers_only_matching_frames() {
    let (dispatcher, handles) = setup(&["veth0"], false);
    let (callback, frames) = channel_callback();
    let filter = compile_filter("ether[0:2] == 0xaaaa").unwrap();
    dispatcher
        .open("veth0", callback, Some(filter), false, false)
        .unwrap();

    let matching = frame_starting_with(&[0xaa, 0xaa]);
    handles[0].inject(&matching).unwrap();
    handles[0].inject(&frame_starting_with(&[0xbb, 0xbb])).unwrap();

    assert_eq!(frames.recv_timeout(WAIT).unwrap(), matching);
    let stats = wait_for_stats(&dispatcher, "veth0", |s| s.rx_frames == 2);
    assert_eq!(stats.rx_frames, 2);
    assert_eq!(stats.rx_discards, 1);
    assert!(frames.recv_timeout(Duration::from_millis(100)).is_err());

    assert!(dispatcher.stop(Some(WAIT)));
}

#[test]
fn test_frames_delivered_in_order() {
    let (dispatcher, handles) = setup(&["veth0"], false);
    let (callback, frames) = channel_callback();
    dispatcher.open("veth0", callback, None, false, false).unwrap();

    for i in 0..50u8 {
        handles[0].inject(&frame_starting_with(&[i])).unwrap();
    }
    for i in 0..50u8 {
        assert_eq!(frames.recv_timeout(WAIT).unwrap()[0], i);
    }

    assert!(dispatcher.stop(Some(WAIT)));
}

#[test]
fn test_duplicate_open_fails() {
    let (dispatcher, handles) = setup(&["eth0"], false);
    let (callback, frames) = channel_callback();
    dispatcher.open("eth0", callback, None, false, false).unwrap();

    handles[0].inject(&frame_starting_with(&[1])).unwrap();
    frames.recv_timeout(WAIT).unwrap();
    let before = wait_for_stats(&dispatcher, "eth0", |s| s.rx_frames == 1);

    let err = dispatcher
        .open("eth0", ignore(), None, false, false)
        .unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyOpen(name) if name == "eth0"));
    assert_eq!(dispatcher.statistics("eth0"), Some(before));
    assert_eq!(handles[0].open_count(), 1);

    // The first port still receives
    handles[0].inject(&frame_starting_with(&[2])).unwrap();
    assert_eq!(frames.recv_timeout(WAIT).unwrap()[0], 2);

    assert!(dispatcher.close("eth0"));
    dispatcher.open("eth0", ignore(), None, false, false).unwrap();
    assert_eq!(dispatcher.statistics("eth0"), Some(Stats::default()));

    assert!(dispatcher.stop(Some(WAIT)));
}

#[test]
fn test_short_frame_is_padded() {
    let (dispatcher, handles) = setup(&["veth0"], true);
    dispatcher.open("veth0", ignore(), None, false, false).unwrap();

    let written = dispatcher.send("veth0", &[0xff; 20]).unwrap();
    assert!(written >= 60);

    let sent = handles[0].sent_frames();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].len() >= 60);
    assert_eq!(&sent[0][..20], &[0xff; 20]);

    let stats = dispatcher.statistics("veth0").unwrap();
    assert_eq!(stats.tx_frames, 1);
    assert_eq!(stats.tx_errors, 0);

    assert!(dispatcher.stop(Some(WAIT)));
}

#[test]
fn test_send_to_unopened_interface() {
    let (dispatcher, _handles) = setup(&["veth0"], false);
    assert!(matches!(
        dispatcher.send("veth0", &[0; 60]),
        Err(DispatchError::NotOpen(_))
    ));
}

#[test]
fn test_closing_one_port_leaves_the_other() {
    let (dispatcher, handles) = setup(&["veth0", "veth1"], false);
    let (cb0, _frames0) = channel_callback();
    let (cb1, frames1) = channel_callback();
    dispatcher.open("veth0", cb0, None, false, false).unwrap();
    dispatcher.open("veth1", cb1, None, false, false).unwrap();

    assert!(dispatcher.close("veth0"));
    assert!(!dispatcher.close("veth0"));
    assert!(dispatcher.statistics("veth0").is_none());
    assert!(!handles[0].is_open());

    handles[1].inject(&frame_starting_with(&[9])).unwrap();
    assert_eq!(frames1.recv_timeout(WAIT).unwrap()[0], 9);
    assert_eq!(dispatcher.send("veth1", &[0; 60]).unwrap(), 60);
    assert_eq!(dispatcher.interfaces(), vec!["veth1".to_string()]);

    assert!(dispatcher.stop(Some(WAIT)));
}

#[test]
fn test_callback_panic_does_not_stop_loop() {
    let (dispatcher, handles) = setup(&["veth0"], false);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let callback: FrameCallback = Arc::new(move |frame: &[u8]| {
        seen.fetch_add(1, Ordering::SeqCst);
        if frame[0] == 0xde {
            panic!("callback failure");
        }
    });
    dispatcher.open("veth0", callback, None, false, false).unwrap();

    handles[0].inject(&frame_starting_with(&[0xde])).unwrap();
    handles[0].inject(&frame_starting_with(&[0x01])).unwrap();

    let stats = wait_for_stats(&dispatcher, "veth0", |s| s.rx_frames == 2);
    assert_eq!(stats.rx_frames, 2);
    let deadline = Instant::now() + WAIT;
    while calls.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(dispatcher.is_running());

    assert!(dispatcher.stop(Some(WAIT)));
}

#[test]
fn test_receive_errors_do_not_stop_the_loop() {
    let (dispatcher, handles) = setup(&["veth0", "veth1"], false);
    let (cb0, frames0) = channel_callback();
    let (cb1, frames1) = channel_callback();
    dispatcher.open("veth0", cb0, None, false, false).unwrap();
    dispatcher.open("veth1", cb1, None, false, false).unwrap();

    handles[0].fail_recv(libc::ENETDOWN);
    handles[0].fail_recv(libc::EIO);
    handles[0].inject(&frame_starting_with(&[1])).unwrap();
    handles[1].inject(&frame_starting_with(&[2])).unwrap();

    assert_eq!(frames0.recv_timeout(WAIT).unwrap()[0], 1);
    assert_eq!(frames1.recv_timeout(WAIT).unwrap()[0], 2);
    let stats = wait_for_stats(&dispatcher, "veth0", |s| s.rx_frames == 1);
    assert_eq!(stats.rx_frames, 1);
    // Only the hard error is counted
    assert_eq!(stats.rx_discards, 1);
    assert_eq!(dispatcher.statistics("veth1").unwrap().rx_discards, 0);
    assert!(dispatcher.is_running());

    handles[0].inject(&frame_starting_with(&[3])).unwrap();
    handles[1].inject(&frame_starting_with(&[4])).unwrap();
    assert_eq!(frames0.recv_timeout(WAIT).unwrap()[0], 3);
    assert_eq!(frames1.recv_timeout(WAIT).unwrap()[0], 4);

    assert!(dispatcher.stop(Some(WAIT)));
}

#[test]
fn test_callback_can_query_dispatcher_during_restart() {
    let (dispatcher, handles) = setup(&["veth0"], false);
    let dispatcher = Arc::new(dispatcher);
    let weak = Arc::downgrade(&dispatcher);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let (running_tx, running_rx) = mpsc::channel::<bool>();
    let running_tx = Mutex::new(running_tx);
    let callback: FrameCallback = Arc::new(move |_frame: &[u8]| {
        let _ = entered_tx.lock().unwrap().send(());
        let _ = release_rx.lock().unwrap().recv_timeout(WAIT);
        let running = weak.upgrade().is_some_and(|d| d.is_running());
        let _ = running_tx.lock().unwrap().send(running);
    });
    dispatcher.open("veth0", callback, None, false, false).unwrap();
    handles[0].inject(&frame_starting_with(&[1])).unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    // The loop is still inside the callback, so this leaves it finishing
    assert!(!dispatcher.stop(Some(Duration::ZERO)));
    let restarter = {
        let dispatcher = Arc::clone(&dispatcher);
        thread::spawn(move || dispatcher.start())
    };
    // Let the restart reach the join on the old loop
    thread::sleep(Duration::from_millis(100));
    release_tx.send(()).unwrap();

    assert!(!running_rx.recv_timeout(WAIT).unwrap());
    restarter.join().unwrap().unwrap();
    assert!(dispatcher.is_running());
    assert!(dispatcher.stop(Some(WAIT)));
}

#[test]
fn test_stop_zero_does_not_wait() {
    let (dispatcher, handles) = setup(&["veth0"], false);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    // Blocks the loop thread inside the callback until released
    let callback: FrameCallback = Arc::new(move |_frame: &[u8]| {
        let _ = entered_tx.lock().unwrap().send(());
        let _ = release_rx.lock().unwrap().recv_timeout(WAIT);
    });
    dispatcher.open("veth0", callback, None, false, false).unwrap();
    handles[0].inject(&frame_starting_with(&[1])).unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    let started = Instant::now();
    assert!(!dispatcher.stop(Some(Duration::ZERO)));
    assert!(started.elapsed() < Duration::from_millis(500));

    release_tx.send(()).unwrap();
}

#[test]
fn test_stop_with_timeout_is_bounded() {
    let (dispatcher, handles) = setup(&["veth0"], false);
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let callback: FrameCallback = Arc::new(move |_frame: &[u8]| {
        let _ = entered_tx.lock().unwrap().send(());
        thread::sleep(Duration::from_millis(1500));
    });
    dispatcher.open("veth0", callback, None, false, false).unwrap();
    handles[0].inject(&frame_starting_with(&[1])).unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    let started = Instant::now();
    assert!(!dispatcher.stop(Some(Duration::from_millis(100))));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(1000));

    // Reopening joins the loop that is still finishing
    dispatcher.open("veth0", ignore(), None, false, false).unwrap();
    assert!(dispatcher.is_running());
    assert!(dispatcher.stop(None));
}

#[test]
fn test_stop_closes_every_port() {
    let (dispatcher, handles) = setup(&["veth0", "veth1"], false);
    dispatcher.open("veth0", ignore(), None, false, false).unwrap();
    dispatcher.open("veth1", ignore(), None, false, false).unwrap();

    assert!(dispatcher.stop(Some(WAIT)));
    assert!(!dispatcher.is_running());
    assert!(handles.iter().all(|h| !h.is_open()));
    assert!(dispatcher.interfaces().is_empty());
}

#[test]
fn test_statistics_for_never_opened_interface() {
    let (dispatcher, _handles) = setup(&["veth0"], false);
    assert!(dispatcher.statistics("veth0").is_none());
    assert!(dispatcher.statistics("nosuch0").is_none());
}

#[test]
fn test_concurrent_send_and_receive() {
    let (dispatcher, handles) = setup(&["veth0"], false);
    let dispatcher = Arc::new(dispatcher);
    let (callback, frames) = channel_callback();
    dispatcher.open("veth0", callback, None, false, false).unwrap();

    let senders: Vec<_> = (0..4)
        .map(|_| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                for _ in 0..25 {
                    dispatcher.send("veth0", &[0x11; 60]).unwrap();
                }
            })
        })
        .collect();
    for i in 0..20u8 {
        handles[0].inject(&frame_starting_with(&[i])).unwrap();
    }
    for sender in senders {
        sender.join().unwrap();
    }
    for _ in 0..20 {
        frames.recv_timeout(WAIT).unwrap();
    }

    let stats = dispatcher.statistics("veth0").unwrap();
    assert_eq!(stats.tx_frames, 100);
    assert_eq!(stats.tx_octets, 6000);
    assert_eq!(handles[0].sent_frames().len(), 100);

    assert!(dispatcher.stop(Some(WAIT)));
}

#[test]
fn test_open_from_other_threads() {
    let factory = LoopbackFactory::new();
    for i in 0..8 {
        factory.add_interface(&format!("veth{}", i), MacAddr6::nil());
    }
    let dispatcher = Arc::new(Dispatcher::with_factory(Arc::new(factory), config()).unwrap());

    let openers: Vec<_> = (0..8)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                dispatcher
                    .open(&format!("veth{}", i), ignore(), None, false, false)
                    .unwrap()
            })
        })
        .collect();
    for opener in openers {
        opener.join().unwrap();
    }

    assert_eq!(dispatcher.interfaces().len(), 8);
    assert!(dispatcher.is_running());
    assert!(dispatcher.stop(Some(WAIT)));
}
