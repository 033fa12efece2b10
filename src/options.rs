use clap::Parser;

/// tsun-proxy - transparent proxy for TSUN micro-inverters
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Overrides the log level from the config file
    #[clap(short = 'l', long = "loglevel")]
    pub loglevel: Option<String>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
