use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "flockctl")]
#[command(about = "CLI for flockraft clusters")]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:9100")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Status,
    Get {
        key: String,
    },
    Put {
        key: String,
        value: String,
    },
    Delete {
        key: String,
    },
    Join {
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        addr: String,
    },
    Leave {
        #[arg(short, long)]
        name: String,
    },
    /// Compact the log of the target node.
    Snapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base_url = cli.addr;

    let resp = match cli.command {
        Commands::Status => client.get(format!("{}/status", base_url)).send().await?,
        Commands::Get { key } => client.get(format!("{}/kv/{}", base_url, key)).send().await?,
        Commands::Put { key, value } => {
            client
                .put(format!("{}/kv/{}", base_url, key))
                .json(&serde_json::json!({ "value": value }))
                .send()
                .await?
        }
        Commands::Delete { key } => {
            client
                .delete(format!("{}/kv/{}", base_url, key))
                .send()
                .await?
        }
        Commands::Join { name, addr } => {
            client
                .post(format!("{}/cluster/join", base_url))
                .json(&serde_json::json!({ "name": name, "addr": addr }))
                .send()
                .await?
        }
        Commands::Leave { name } => {
            client
                .post(format!("{}/cluster/leave", base_url))
                .json(&serde_json::json!({ "name": name }))
                .send()
                .await?
        }
        Commands::Snapshot => client.post(format!("{}/snapshot", base_url)).send().await?,
    };

    let status = resp.status();
    let body: Value = resp.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        anyhow::bail!("request failed with {}", status);
    }

    Ok(())
}
