// asirikuy_tester/src/cli.rs

/// Structure representing command-line arguments.
#[derive(Debug)]
pub struct Args {
    pub config: std::path::PathBuf,
    pub log_level: Option<String>,
}

impl Args {
    /// Parses command-line arguments using `clap`.
    ///
    /// # Returns
    /// * `Args` - Struct containing parsed arguments.
    pub fn parse() -> Self {
        let matches = clap::Command::new("Asirikuy Tester")
            .version("0.1.0")
            .about("Per-bar strategy tester and optimizer for the Asirikuy framework")
            .arg(
                clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the run configuration JSON file")
                .required(true)
                .num_args(1),
            )
            .arg(
                clap::Arg::new("log-level")
                .short('l')
                .long("log-level")
                .help("Log filter, e.g. info or asirikuy_core=debug (overrides RUST_LOG)")
                .num_args(1),
            )
            .get_matches();

        Args {
            config: matches.get_one::<String>("config").cloned().unwrap_or_default().into(),
            log_level: matches.get_one::<String>("log-level").cloned(),
        }
    }
}
