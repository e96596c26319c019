//! Two endpoints on opposite sides, each on its own thread.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use baton::{Channel, ChannelConfig, ChannelState, ErrorKind, Namespace, PollStrategy, Side};

const ROUNDS: i32 = 200;

fn host(ns: &Namespace, name: &str, capacity: usize) -> Channel {
    Channel::new(ns, name, ChannelConfig::create(capacity).with_timeout_secs(20.0)).unwrap()
}

fn guest_config() -> ChannelConfig {
    ChannelConfig::join()
        .with_side(Side::Secondary)
        .with_timeout_secs(20.0)
        .with_poll(PollStrategy::Yield)
}

/// Marks the start of a turn; panics if the other side is inside one.
fn enter(in_turn: &AtomicBool) {
    assert!(
        !in_turn.swap(true, Ordering::SeqCst),
        "both endpoints hold the turn"
    );
}

fn leave(in_turn: &AtomicBool) {
    in_turn.store(false, Ordering::SeqCst);
}

#[test]
fn channel_can_move_between_threads() {
    fn assert_send<T: Send>() {}
    assert_send::<Channel>();
}

#[test]
fn test_ping_pong_mutual_exclusion() {
    let (_dir, ns) = support::namespace();
    let in_turn = Arc::new(AtomicBool::new(false));

    let mut host = host(&ns, "pingpong", 64);
    host.write_i32(0, 0).unwrap();

    let guest = {
        let ns = ns.clone();
        let in_turn = in_turn.clone();
        thread::spawn(move || {
            let mut chan = Channel::new(&ns, "pingpong", guest_config()).unwrap();
            let mut turns = 0;
            loop {
                enter(&in_turn);
                let snap = chan.snapshot().unwrap();
                assert!(snap.secondary_active && !snap.primary_active, "{snap}");
                let (value, _) = chan.read_i32(0).unwrap();
                chan.write_i32(0, value + 1).unwrap();
                turns += 1;
                leave(&in_turn);

                match chan.give_control(true) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::PeerClosed => return turns,
                    Err(e) => panic!("guest failed: {e}"),
                }
            }
        })
    };

    for round in 0..ROUNDS {
        enter(&in_turn);
        let snap = host.snapshot().unwrap();
        assert!(snap.primary_active && !snap.secondary_active, "{snap}");
        let (value, _) = host.read_i32(0).unwrap();
        assert_eq!(value, round * 2);
        host.write_i32(0, value + 1).unwrap();
        leave(&in_turn);

        host.give_control(true).unwrap();
    }

    assert_eq!(host.read_i32(0).unwrap().0, ROUNDS * 2);
    host.close();

    assert_eq!(guest.join().unwrap(), ROUNDS);
    // The guest saw the closed flag and removed the files.
    assert!(!ns.control_path("pingpong").exists());
}

#[test]
fn test_joiner_blocks_until_given_control() {
    let (_dir, ns) = support::namespace();
    let mut host = host(&ns, "blocking", 16);
    host.write_i32(0, 7).unwrap();

    let joined = Arc::new(AtomicBool::new(false));
    let guest = {
        let ns = ns.clone();
        let joined = joined.clone();
        thread::spawn(move || {
            let mut chan = Channel::new(&ns, "blocking", guest_config()).unwrap();
            joined.store(true, Ordering::SeqCst);
            let value = chan.read_i32(0).unwrap().0;
            chan.give_control(false).unwrap();
            value
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!joined.load(Ordering::SeqCst));

    host.give_control(true).unwrap();
    assert!(joined.load(Ordering::SeqCst));
    assert_eq!(guest.join().unwrap(), 7);
    assert_eq!(host.state(), ChannelState::Idle);
    host.delete();
}

#[test]
fn test_peer_resize_is_followed_after_wait() {
    let (_dir, ns) = support::namespace();
    let mut host = host(&ns, "grow", 100);
    host.write_string(42, "foo").unwrap();

    let guest = {
        let ns = ns.clone();
        thread::spawn(move || {
            let mut chan = Channel::new(&ns, "grow", guest_config()).unwrap();
            let old = chan.read_string(42).unwrap().0;
            chan.give_control(true).unwrap();

            // The host resized during its turn; the wait already remapped.
            assert_eq!(chan.generation(), 2);
            assert_eq!(chan.capacity(), 200);
            let new = chan.read_string(142).unwrap().0;
            assert_eq!(chan.read_string(42).unwrap().0, "foo");

            chan.resize(400).unwrap();
            chan.write_string(342, "bar342").unwrap();
            chan.give_control(false).unwrap();
            (old, new)
        })
    };

    // Let the guest attach to generation 1 first.
    host.give_control(true).unwrap();
    host.resize(200).unwrap();
    host.write_string(142, "bar142").unwrap();
    host.give_control(true).unwrap();

    let (old, new) = guest.join().unwrap();
    assert_eq!((old.as_str(), new.as_str()), ("foo", "bar142"));

    assert_eq!(host.generation(), 3);
    assert_eq!(host.capacity(), 400);
    assert_eq!(host.read_string(342).unwrap().0, "bar342");
    assert_eq!(host.read_string(42).unwrap().0, "foo");
    host.delete();
    ns.delete_files("grow").unwrap();
}

#[test]
fn test_peer_closed_while_blocked() {
    let (_dir, ns) = support::namespace();
    let mut host = host(&ns, "dying", 16);

    let guest = {
        let ns = ns.clone();
        thread::spawn(move || Channel::new(&ns, "dying", guest_config()).map(|_| ()))
    };

    thread::sleep(Duration::from_millis(50));
    host.close();

    let err = guest.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerClosed);
    assert!(!ns.control_path("dying").exists());
}

#[test]
fn test_timeout_is_bounded() {
    let (_dir, ns) = support::namespace();
    let mut host = host(&ns, "slow", 16);

    let guest = {
        let ns = ns.clone();
        thread::spawn(move || {
            let config = guest_config()
                .with_timeout_secs(0.2)
                .with_poll(PollStrategy::Sleep(Duration::from_millis(1)));
            let started = Instant::now();
            let err = Channel::new(&ns, "slow", config).unwrap_err();
            (err.kind(), started.elapsed())
        })
    };

    let (kind, elapsed) = guest.join().unwrap();
    assert_eq!(kind, ErrorKind::Timeout);
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");

    // The timed-out guest closed the channel on its way out.
    assert_eq!(host.read_i32(0).unwrap_err().kind(), ErrorKind::PeerClosed);
}
