//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Data directory for the settings file
    #[arg(short, long, global = true)]
    pub data_dir: Option<String>,

    /// GATT service the peripheral advertises
    #[arg(short, long, global = true)]
    pub service: Option<Uuid>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Attach to a peripheral and report it
    Attach {
        /// Scan even when a peripheral was attached before
        #[arg(short, long)]
        force_scan: bool,
    },
    /// Read a characteristic once
    Read {
        /// Characteristic UUID
        #[arg(short, long)]
        characteristic: Uuid,
    },
    /// Write hex-encoded bytes to a characteristic
    Write {
        /// Characteristic UUID
        #[arg(short, long)]
        characteristic: Uuid,
        /// Payload as hex, e.g. 7e0404f00001ff00ef
        #[arg(long)]
        data: String,
        /// Wait for the peripheral to acknowledge the write
        #[arg(long)]
        ack: bool,
    },
    /// Subscribe to a characteristic and print notifications
    Notify {
        /// Characteristic UUID
        #[arg(short, long)]
        characteristic: Uuid,
        /// How long to listen
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
    /// Read the link RSSI
    Rssi {
        /// Number of readings, one per second
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Show the link snapshot and the remembered peripheral
    Status,
    /// Forget the remembered peripheral
    Forget,
}
