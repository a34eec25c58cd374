use gumdrop::Options;

use httpload::{util, Configuration, LoadTest, LoadTestError};

// Print the error the way gumdrop prints option errors, and give the shell a
// failing exit code.
fn exit_with(error: LoadTestError) -> ! {
    eprintln!("{}", error);
    std::process::exit(1);
}

fn main() {
    // Parse the run-time options; gumdrop prints usage and exits on --help.
    let configuration = Configuration::parse_args_default_or_exit();

    if configuration.version {
        println!("httpload {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    // The final snapshot is optionally also written to a json report file.
    let report_file = configuration.report_file.clone();

    let load_test = match LoadTest::initialize_with_config(configuration) {
        Ok(load_test) => load_test,
        Err(error) => exit_with(error),
    };

    // The first ctrl-c stops the test cleanly so the final metrics still
    // print; a second one exits immediately.
    util::setup_ctrlc_handler(&load_test.stop_handle());

    let metrics = match load_test.execute() {
        Ok(metrics) => metrics,
        Err(error) => exit_with(error),
    };

    print!("{}", metrics);

    if !report_file.is_empty() {
        let report = match serde_json::to_string_pretty(&metrics) {
            Ok(report) => report,
            Err(error) => {
                eprintln!("failed to serialize report: {}", error);
                std::process::exit(1);
            }
        };
        if let Err(error) = std::fs::write(&report_file, report) {
            eprintln!("failed to write report to {}: {}", report_file, error);
            std::process::exit(1);
        }
        println!("wrote json report to: {}", report_file);
    }
}
