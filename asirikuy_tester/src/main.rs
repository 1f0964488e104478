// asirikuy_tester/src/main.rs

mod cli;
mod runner;

fn main() -> anyhow::Result<()> {
    let start_time = std::time::Instant::now();

    let args = cli::Args::parse();
    let filter = match &args.log_level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = asirikuy_core::settings::Settings::load(&args.config)?;
    tracing::info!("Mode {} with {} systems", settings.common.mode, settings.systems.len());

    let mut test_runner = runner::TestRunner::new(settings)?;
    runner::install_interrupt_handler(test_runner.get_stop_handle());
    test_runner.run()?;

    println!("The main programm is finished in {:.3} seconds", start_time.elapsed().as_secs_f64());
    anyhow::Ok(())
}
