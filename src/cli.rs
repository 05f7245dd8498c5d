use clap::{Parser, Subcommand};

/// smartq: token queue administration
#[derive(Parser)]
#[command(name = "smartq", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply database migrations
    Migrate,

    /// Manage services
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },

    /// Issue and act on individual tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Drive a service's queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand)]
pub enum ServiceCommands {
    /// Register a new service
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "general")]
        service_type: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long, default_value = "1")]
        counters: i32,
        /// Average minutes per token
        #[arg(long)]
        avg_service_time: Option<i32>,
    },
    /// List services
    List,
    /// Show the live queue of a service
    Status {
        #[arg(long)]
        service_id: String,
        /// Also print recent audit entries
        #[arg(long, default_value = "0")]
        audit: i64,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a token to a user
    Issue {
        #[arg(long)]
        service_id: String,
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value = "0")]
        priority: i32,
    },
    /// Estimated wait for a token
    Eta {
        #[arg(long)]
        token_id: String,
    },
    /// Skip a token with a reason (admin)
    Skip {
        #[arg(long)]
        token_id: String,
        #[arg(long)]
        admin_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Cancel a token. With --user-id, acts as the owner.
    Cancel {
        #[arg(long)]
        token_id: String,
        #[arg(long, conflicts_with = "user_id")]
        admin_id: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Complete a specific token
    Complete {
        #[arg(long)]
        token_id: String,
        #[arg(long)]
        admin_id: Option<String>,
    },
    /// Change a token's priority level
    Priority {
        #[arg(long)]
        token_id: String,
        #[arg(long)]
        level: i32,
        #[arg(long)]
        admin_id: Option<String>,
    },
    /// Send an SMS to the token's holder
    Notify {
        #[arg(long)]
        token_id: String,
        #[arg(long)]
        admin_id: Option<String>,
        /// Free text message (max 160 characters)
        #[arg(long, conflicts_with = "template")]
        message: Option<String>,
        /// Canned message: next, serving, delayed
        #[arg(long)]
        template: Option<String>,
    },
    /// List a user's tokens
    Mine {
        #[arg(long)]
        user_id: String,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Complete the serving token and call the next one
    Next {
        #[arg(long)]
        service_id: String,
        #[arg(long)]
        admin_id: String,
    },
    /// Start serving only if the counter is free
    Serve {
        #[arg(long)]
        service_id: String,
    },
    /// Stop calling new tokens
    Pause {
        #[arg(long)]
        service_id: String,
        #[arg(long)]
        admin_id: Option<String>,
    },
    /// Resume calling tokens
    Resume {
        #[arg(long)]
        service_id: String,
        #[arg(long)]
        admin_id: Option<String>,
    },
    /// Renumber waiting tokens in the given order (service must be paused)
    Reorder {
        #[arg(long)]
        service_id: String,
        /// Every waiting token id, front of the queue first
        #[arg(long, value_delimiter = ',', required = true)]
        order: Vec<String>,
        #[arg(long)]
        admin_id: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_tree_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_reorder_splits_ids() {
        let cli = Cli::try_parse_from([
            "smartq", "queue", "reorder", "--service-id", "s", "--order", "a,b,c",
        ])
        .unwrap();
        match cli.command {
            Commands::Queue {
                command: QueueCommands::Reorder { order, .. },
            } => assert_eq!(order, vec!["a", "b", "c"]),
            _ => panic!("expected queue reorder"),
        }
    }
}
