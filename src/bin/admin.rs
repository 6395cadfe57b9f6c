//! Docsync Admin CLI
//!
//! Administration tool for the sync server's documents and API keys.
//!
//! # Usage
//!
//! ```bash
//! docsync-admin document create meeting-notes --title "Meeting notes"
//! docsync-admin document list
//! docsync-admin document show meeting-notes
//! docsync-admin key generate --name laptop
//! ```
//!
//! Reads the same configuration as `docsync-server` to locate the database.

use clap::{Args, Parser, Subcommand};
use docsync::config::ServerConfig;
use docsync::server::{init_db, DocumentRecord, DocumentStore};
use docsync_core::{DocumentId, LocalMutation, Replica};
use rand::Rng;
use std::path::PathBuf;

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "docsync-admin")]
#[command(version)]
#[command(about = "Docsync server administration tool")]
struct Cli {
    /// Path to the server config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage documents
    Document(DocumentCommand),
    /// Manage API keys
    Key(KeyCommand),
}

#[derive(Args)]
struct DocumentCommand {
    #[command(subcommand)]
    command: DocumentSubcommand,
}

#[derive(Subcommand)]
enum DocumentSubcommand {
    /// Provision a new document
    Create {
        /// Document ID (generated if omitted)
        id: Option<String>,
        /// Initial title
        #[arg(long, short)]
        title: Option<String>,
    },
    /// List all documents
    List,
    /// Show a document's current content
    Show {
        /// Document ID
        id: String,
    },
}

#[derive(Args)]
struct KeyCommand {
    #[command(subcommand)]
    command: KeySubcommand,
}

#[derive(Subcommand)]
enum KeySubcommand {
    /// Generate a new API key and print its config entry
    Generate {
        /// Who the key is for
        #[arg(long, short)]
        name: Option<String>,
    },
}

// ============================================================================
// Commands
// ============================================================================

async fn open_store(config: &ServerConfig) -> Result<DocumentStore, Box<dyn std::error::Error>> {
    let pool = init_db(&config.database_path()).await?;
    Ok(DocumentStore::new(pool))
}

async fn create_document(
    store: &DocumentStore,
    id: Option<String>,
    title: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let document_id = match id {
        Some(id) => DocumentId::parse(&id)?,
        None => DocumentId::generate(),
    };

    let snapshot = match &title {
        Some(title) => {
            let mut replica = Replica::new();
            replica.apply(LocalMutation::set_title(title.clone()))?;
            replica.encode()
        }
        None => Replica::genesis_snapshot(),
    };

    store.create(&document_id, &snapshot, None).await?;

    println!("Created document: {}", document_id);
    if let Some(title) = title {
        println!("  Title: {}", title);
    }

    Ok(())
}

fn describe(record: &DocumentRecord) -> Result<(String, String), Box<dyn std::error::Error>> {
    let replica = Replica::from_snapshot(&record.snapshot())?;
    Ok((replica.title()?, replica.text()?))
}

async fn list_documents(store: &DocumentStore) -> Result<(), Box<dyn std::error::Error>> {
    let records = store.list().await?;

    if records.is_empty() {
        println!("No documents provisioned.");
        return Ok(());
    }

    println!("{:<40} {:<24} {:>8} {:<20}", "DOCUMENT", "TITLE", "VERSION", "LAST CLIENT");
    println!("{}", "-".repeat(95));

    for record in &records {
        let (title, _) = describe(record)?;
        println!(
            "{:<40} {:<24} {:>8} {:<20}",
            record.document_id,
            title,
            record.version,
            record.last_client_id.as_deref().unwrap_or("-")
        );
    }

    println!();
    println!("Total: {} document(s)", records.len());

    Ok(())
}

async fn show_document(store: &DocumentStore, id: String) -> Result<(), Box<dyn std::error::Error>> {
    let document_id = DocumentId::parse(&id)?;

    let Some(record) = store.get(&document_id).await? else {
        eprintln!("Error: Document '{}' not found", id);
        std::process::exit(1);
    };

    let (title, text) = describe(&record)?;
    println!("Document: {}", record.document_id);
    println!("  Title: {}", title);
    println!("  Version: {}", record.version);
    println!("  Updated: {}", record.updated_at);
    if let Some(client) = &record.last_client_id {
        println!("  Last client: {}", client);
    }
    println!();
    println!("{}", text);

    Ok(())
}

fn generate_key(name: Option<String>) {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    let key = URL_SAFE_NO_PAD.encode(bytes);

    println!("Add this entry to the server config's api_keys:");
    println!();
    println!("  - key: \"{}\"", key);
    if let Some(name) = name {
        println!("    name: \"{}\"", name);
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config)?;

    match cli.command {
        Commands::Document(cmd) => {
            let store = open_store(&config).await?;
            match cmd.command {
                DocumentSubcommand::Create { id, title } => {
                    create_document(&store, id, title).await
                }
                DocumentSubcommand::List => list_documents(&store).await,
                DocumentSubcommand::Show { id } => show_document(&store, id).await,
            }
        }
        Commands::Key(cmd) => {
            match cmd.command {
                KeySubcommand::Generate { name } => generate_key(name),
            }
            Ok(())
        }
    }
}
