//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged with
//! the configuration from the `brewq.toml` file and environment variables.

use clap::{Parser, Subcommand};
use figment::{
    value::{Dict, Map, Tag, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Fans brewery records out to durable queues and consumes them reliably.
#[derive(Parser, Debug, Default, Clone)]
#[command(author, version, about, long_about = None, subcommand_required = true, arg_required_else_help = true)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Host name or address of the message broker.
    #[arg(long, value_name = "HOST", global = true)]
    pub host: Option<String>,

    /// Log level filter (overridden by RUST_LOG).
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Read the source file once and publish one message per record to every queue.
    Distribute {
        /// Path to the delimited source dataset.
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Minimum delay between two publishes, in milliseconds.
        #[arg(long, value_name = "MS")]
        publish_delay_ms: Option<u64>,

        /// Delete and re-declare every queue before publishing.
        #[arg(long)]
        reset_queues: bool,
    },
    /// Run one dispatcher per bound queue until interrupted.
    Consume {
        /// Maximum unacknowledged deliveries per dispatcher.
        #[arg(long, value_name = "N")]
        prefetch: Option<u16>,
    },
}

fn insert_nested(dict: &mut Dict, section: &str, key: &str, value: Value) {
    let entry = dict
        .entry(section.to_string())
        .or_insert_with(|| Value::Dict(Tag::Default, Dict::new()));
    if let Value::Dict(_, inner) = entry {
        inner.insert(key.to_string(), value);
    }
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(host) = &self.host {
            insert_nested(&mut dict, "broker", "host", Value::from(host.clone()));
        }

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        match &self.command {
            Some(Command::Distribute {
                input,
                publish_delay_ms,
                reset_queues,
            }) => {
                if let Some(path) = input {
                    insert_nested(
                        &mut dict,
                        "distributor",
                        "input_path",
                        Value::from(path.display().to_string()),
                    );
                }
                if let Some(delay) = publish_delay_ms {
                    insert_nested(
                        &mut dict,
                        "distributor",
                        "publish_delay_ms",
                        Value::from(*delay),
                    );
                }
                // A bare flag can only switch the reset on; absence keeps the file's value.
                if *reset_queues {
                    insert_nested(&mut dict, "distributor", "reset_queues", Value::from(true));
                }
            }
            Some(Command::Consume { prefetch }) => {
                if let Some(limit) = prefetch {
                    insert_nested(&mut dict, "dispatcher", "prefetch", Value::from(*limit));
                }
            }
            None => {}
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
