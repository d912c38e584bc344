use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "point-renew")]
#[command(about = "Automated point renewal and reconciliation for hosted provisioning systems")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database and write a configuration template
    Init {
        /// Where to write the configuration template
        #[arg(long, default_value = "config/local.toml")]
        output: String,

        /// Overwrite an existing template
        #[arg(short, long)]
        force: bool,
    },

    /// Register or update a system
    AddSystem {
        /// Local system id
        id: String,

        /// Identifier of the system on the partner platform
        external_id: String,

        /// Panel login for this system
        #[arg(long, default_value = "")]
        panel_user: String,

        /// Panel password for this system
        #[arg(long, default_value = "")]
        panel_password: String,

        /// Point capacity
        #[arg(long, default_value = "0")]
        max_points: u32,
    },

    /// Record a point created by hand
    AddPoint {
        /// System the point belongs to
        system: String,

        username: String,

        password: String,

        /// Expiry, `dd/mm/yyyy [HH:MM[:SS]]` or `yyyy-mm-dd [HH:MM:SS]`
        #[arg(short, long)]
        expires: String,
    },

    /// Enqueue renewals for systems nearing expiry
    Scan {
        /// Dispatch enqueued work right away and wait for it
        #[arg(long)]
        run: bool,
    },

    /// Force a renewal for one system and wait for the attempt
    Renew {
        system: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the renewal queue
    Queue {
        /// Output format: table or json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Cancel queued renewal work for a system
    Cancel { system: String },

    /// Compare the local store with the partner API
    Reconcile {
        /// Show only divergent and one-sided entries
        #[arg(short, long)]
        divergent: bool,

        /// Output format: table or json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Push a local point to the partner API
    Push {
        username: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Pull a point (or, with --counts, a system's counts) from the partner API
    Pull {
        /// Point username, or system external id with --counts
        target: String,

        #[arg(long)]
        counts: bool,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Run the extraction chain over a captured text file
    Extract {
        file: String,

        /// Print the password instead of a masked value
        #[arg(long)]
        show_secret: bool,
    },

    /// Run the renewal and reconciliation loops until interrupted
    Auto,

    /// Serve the operator API alongside the background loops
    Serve {
        /// Bind address, overrides server.bind
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Show statistics and recent audit records
    Stats {
        /// Output format: table or json
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}
