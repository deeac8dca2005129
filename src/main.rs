use airpods_listener::app::{Options, RunError, run_with_io};
use airpods_listener::scanner::open_radio;
use clap::Parser;
use log::{LevelFilter, error};
use std::panic::{self, PanicHookInfo};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr; stdout carries only the report.
///
/// `RUST_LOG` takes precedence over the default level picked by `--verbose`.
fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

async fn run(options: Options) -> Result<(), RunError> {
    let radio = open_radio(options.backend);
    let mut stdout = std::io::stdout().lock();
    run_with_io(&options, radio, &mut stdout).await.map(|_| ())
}

fn main() {
    let options = Options::parse();
    init_logging(options.verbose);

    // Faults inside the watcher are caught per advertisement, so the hook
    // only reports; the exit code is decided below.
    panic::set_hook(Box::new(|info: &PanicHookInfo| {
        error!("Panic! {info}");
    }));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(why) => {
            error!("Failed to start runtime: {why}");
            std::process::exit(EXIT_ERROR);
        }
    };

    let code = match panic::catch_unwind(panic::AssertUnwindSafe(|| runtime.block_on(run(options))))
    {
        Ok(Ok(())) => EXIT_SUCCESS,
        Ok(Err(why)) => {
            error!("{why}");
            EXIT_ERROR
        }
        Err(_) => EXIT_PANIC,
    };
    std::process::exit(code);
}
