use clap::{Parser, Subcommand};

/// Dispatch and reliability gateway fronting a fleet of on-device model servers.
#[derive(Parser)]
#[command(name = "device-gateway", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Override AppConfig's bind_addr
        #[arg(long)]
        bind_addr: Option<String>,

        /// Override AppConfig's registry_path
        #[arg(long)]
        registry_path: Option<String>,

        /// Override AppConfig's job_workers
        #[arg(long)]
        job_workers: Option<usize>,
    },
}
