use httpmock::prelude::*;
use std::thread;
use std::time::{Duration, Instant};

use httpload::LoadTest;

mod common;

#[test]
// stop() is idempotent and callable from any thread: several racing calls
// have the same effect as one, and the test ends promptly after the first.
fn test_stop_is_idempotent_and_prompt() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).body("ok");
    });

    let configuration = common::build_configuration(&server, vec!["--run-time", "30"]);
    let load_test = LoadTest::initialize_with_config(configuration)
        .expect("failed to initialize the load test");
    let stop_handle = load_test.stop_handle();

    // Several threads race to stop the test shortly after it starts.
    let mut stoppers = Vec::new();
    for _ in 0..3 {
        let stop_handle = stop_handle.clone();
        stoppers.push(thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            stop_handle.stop();
        }));
    }

    let started = Instant::now();
    let metrics = load_test.execute().expect("load test failed");
    for stopper in stoppers {
        stopper.join().expect("stopper thread panicked");
    }

    // The test ended promptly after the first stop call, not after the
    // configured 30 seconds.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(metrics.duration < 5.0);

    // Half a second was plenty to complete requests before stopping.
    assert!(index.hits() > 0);
    assert!(metrics.completed >= 1);

    assert!(stop_handle.is_stopped());
    // Stopping an already finished test is still safe.
    stop_handle.stop();
}

#[test]
// A stop issued before the run starts aborts ramp-up entirely: no workers,
// no requests, and still a well-formed snapshot.
fn test_stop_before_start_admits_no_workers() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).body("ok");
    });

    let configuration = common::build_configuration(&server, vec!["--run-time", "30"]);
    let load_test = LoadTest::initialize_with_config(configuration)
        .expect("failed to initialize the load test");
    load_test.stop();

    let started = Instant::now();
    let metrics = load_test.execute().expect("load test failed");

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(metrics.workers, 0);
    assert_eq!(metrics.completed, 0);
    assert_eq!(metrics.failed, 0);
    assert_eq!(metrics.failure_rate, 0.0);
    assert_eq!(metrics.request_rate, 0.0);
    assert_eq!(index.hits(), 0);
}
