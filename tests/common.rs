use gumdrop::Options;
use httpmock::MockServer;

use httpload::metrics::MetricsSnapshot;
use httpload::{Configuration, LoadTest};

/// Not all functions are used by all tests, so we enable allow(dead_code) to
/// avoid compiler warnings during testing.

/// Build a configuration without a mock server; `custom` must include
/// `--host`. The following options are configured by default, if not set to
/// a custom value:
///  --rampup-rate 10
///  --run-time 1
#[allow(dead_code)]
pub fn build_standalone_configuration(custom: Vec<&str>) -> Configuration {
    let mut configuration = custom;

    // Default to admitting workers quickly if not otherwise configured.
    if !configuration.contains(&"--rampup-rate") {
        configuration.extend_from_slice(&["--rampup-rate", "10"]);
    }

    // Default to running for 1 second if not otherwise configured.
    if !configuration.contains(&"--run-time") {
        configuration.extend_from_slice(&["--run-time", "1"]);
    }

    // Parse these options to generate a Configuration.
    Configuration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Build a configuration targeting a mock server, with the same defaults as
/// [`build_standalone_configuration`].
#[allow(dead_code)]
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> Configuration {
    // Declare server_url here no matter what, so its lifetime is sufficient
    // when needed.
    let server_url = server.base_url();

    let mut configuration = custom;

    // Default to targeting the mock server if not otherwise configured.
    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", &server_url]);
    }

    build_standalone_configuration(configuration)
}

/// Run an already configured load test to completion, returning the final
/// metrics snapshot.
#[allow(dead_code)]
pub fn run_load_test(configuration: Configuration) -> MetricsSnapshot {
    LoadTest::initialize_with_config(configuration)
        .expect("failed to initialize the load test")
        .execute()
        .expect("load test failed")
}
