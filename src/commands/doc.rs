//! Document commands: create, edit and follow collaborative documents.

use std::time::Duration;

use clap::{Args, Subcommand};
use docsync::config::ClientConfig;
use docsync_core::{
    ChangeOrigin, ClientId, CollabSession, DocumentId, DocumentIdError, LocalDocStorage,
    LocalMutation, LocalStorageError, PresenceUpdate, ReplicaError, ReplicaHandle, ReplicaStore,
    SessionConfig, SessionMode, SnapshotClient, SyncError, WebSocketRelay,
};
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;

/// How long to wait for the relay's initial sync before editing offline.
const SYNC_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Args)]
pub struct DocCommand {
    #[command(subcommand)]
    command: DocSubcommand,
}

#[derive(Debug, Subcommand)]
enum DocSubcommand {
    /// Create a new local document
    New {
        /// Initial title
        #[arg(long, short)]
        title: Option<String>,
    },
    /// List documents stored locally
    List,
    /// Print a document's title and text
    Show {
        /// Document ID
        id: String,
    },
    /// Edit a document and push the result to the server
    Edit {
        /// Document ID
        id: String,
        /// Replace the title
        #[arg(long)]
        title: Option<String>,
        /// Position for --insert and --delete
        #[arg(long)]
        at: Option<usize>,
        /// Delete this many characters at --at
        #[arg(long, requires = "at")]
        delete: Option<usize>,
        /// Insert text at --at
        #[arg(long, requires = "at")]
        insert: Option<String>,
        /// Append text to the end
        #[arg(long)]
        append: Option<String>,
    },
    /// Push the local copy of a document to the server
    Push {
        /// Document ID
        id: String,
    },
    /// Follow a document live until interrupted
    Watch {
        /// Document ID
        id: String,
    },
}

impl DocCommand {
    pub async fn run(&self, config: &ClientConfig) -> Result<(), DocCommandError> {
        let storage = LocalDocStorage::new(config.data_dir.clone());

        match &self.command {
            DocSubcommand::New { title } => new_document(storage, title.clone()).await,
            DocSubcommand::List => list_documents(&storage),
            DocSubcommand::Show { id } => show_document(storage, config, id).await,
            DocSubcommand::Edit {
                id,
                title,
                at,
                delete,
                insert,
                append,
            } => {
                let edits = Edits {
                    title: title.clone(),
                    at: at.unwrap_or(0),
                    delete: *delete,
                    insert: insert.clone(),
                    append: append.clone(),
                };
                edit_document(storage, config, id, edits).await
            }
            DocSubcommand::Push { id } => push_document(&storage, config, id).await,
            DocSubcommand::Watch { id } => watch_document(storage, config, id).await,
        }
    }
}

struct Edits {
    title: Option<String>,
    at: usize,
    delete: Option<usize>,
    insert: Option<String>,
    append: Option<String>,
}

impl Edits {
    fn is_empty(&self) -> bool {
        self.title.is_none() && self.delete.is_none() && self.insert.is_none() && self.append.is_none()
    }

    /// Mutations in application order. `length` is the current text length.
    fn mutations(self, length: usize) -> Vec<LocalMutation> {
        let mut mutations = Vec::new();
        let mut length = length;

        if let Some(title) = self.title {
            mutations.push(LocalMutation::set_title(title));
        }
        if let Some(len) = self.delete {
            mutations.push(LocalMutation::delete(self.at, len));
            length = length.saturating_sub(len);
        }
        if let Some(text) = self.insert {
            length += text.chars().count();
            mutations.push(LocalMutation::insert(self.at, text));
        }
        if let Some(text) = self.append {
            mutations.push(LocalMutation::insert(length, text));
        }

        mutations
    }
}

fn session_config(config: &ClientConfig) -> SessionConfig {
    SessionConfig {
        server_url: config.server_url.clone(),
        api_key: config.api_key.clone(),
        client_id: ClientId::generate(),
        name: config.client_name.clone(),
    }
}

async fn open_session(
    store: &ReplicaStore,
    config: &ClientConfig,
    document_id: &DocumentId,
) -> Result<CollabSession<WebSocketRelay>, DocCommandError> {
    let session = CollabSession::open(store, document_id, session_config(config)).await?;

    match session.mode() {
        SessionMode::Live => {
            if !session.adapter().wait_synced(SYNC_WAIT).await {
                println!(
                    "Relay did not sync within {}s; editing offline.",
                    SYNC_WAIT.as_secs()
                );
            }
        }
        SessionMode::Offline => {
            println!("Server unavailable; editing offline.");
        }
    }

    Ok(session)
}

/// Closes the session, pushing a final snapshot. An unreachable server is
/// not an error: the local copy has already been saved.
async fn finish(session: CollabSession<WebSocketRelay>) -> Result<(), DocCommandError> {
    match session.close().await {
        Ok(()) => {
            println!("Synced with server.");
            Ok(())
        }
        Err(SyncError::HttpError(e)) => {
            println!("Could not reach server ({}); changes kept locally.", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn print_document(replica: &ReplicaHandle) -> Result<(), DocCommandError> {
    let title = replica.title().await?;
    if !title.is_empty() {
        println!("# {}", title);
        println!();
    }
    println!("{}", replica.text().await?);
    Ok(())
}

async fn new_document(storage: LocalDocStorage, title: Option<String>) -> Result<(), DocCommandError> {
    let document_id = DocumentId::generate();
    let store = ReplicaStore::with_storage(storage);
    let replica = store.open(&document_id).await?;

    if let Some(title) = title {
        replica.apply(LocalMutation::set_title(title)).await?;
    }
    store.persist(&document_id).await?;

    println!("Created document: {}", document_id);
    println!();
    println!("Provision it on the server with:");
    println!("  docsync-admin document create {}", document_id);

    Ok(())
}

fn list_documents(storage: &LocalDocStorage) -> Result<(), DocCommandError> {
    let ids = storage.list()?;

    if ids.is_empty() {
        println!("No local documents.");
        return Ok(());
    }

    println!("{:<40} {:<30}", "DOCUMENT", "TITLE");
    println!("{}", "-".repeat(70));

    for id in &ids {
        let title = match storage.load(id)? {
            Some(snapshot) => docsync_core::Replica::from_snapshot(&snapshot)?.title()?,
            None => String::new(),
        };
        println!("{:<40} {:<30}", id, title);
    }

    println!();
    println!("Total: {} document(s)", ids.len());

    Ok(())
}

async fn show_document(
    storage: LocalDocStorage,
    config: &ClientConfig,
    id: &str,
) -> Result<(), DocCommandError> {
    let document_id = DocumentId::parse(id)?;
    let store = ReplicaStore::with_storage(storage);
    let session = open_session(&store, config, &document_id).await?;

    session.adapter().destroy().await;
    store.persist(&document_id).await?;

    println!();
    print_document(&session.replica()).await
}

async fn edit_document(
    storage: LocalDocStorage,
    config: &ClientConfig,
    id: &str,
    edits: Edits,
) -> Result<(), DocCommandError> {
    if edits.is_empty() {
        return Err(DocCommandError::NothingToDo);
    }

    let document_id = DocumentId::parse(id)?;
    let store = ReplicaStore::with_storage(storage);
    let session = open_session(&store, config, &document_id).await?;

    let length = session.replica().text().await?.chars().count();
    for mutation in edits.mutations(length) {
        session.apply(mutation).await?;
    }
    store.persist(&document_id).await?;

    print_document(&session.replica()).await?;
    println!();
    finish(session).await
}

async fn push_document(
    storage: &LocalDocStorage,
    config: &ClientConfig,
    id: &str,
) -> Result<(), DocCommandError> {
    let document_id = DocumentId::parse(id)?;
    let Some(snapshot) = storage.load(&document_id)? else {
        return Err(DocCommandError::NoLocalCopy(document_id.to_string()));
    };

    let client = SnapshotClient::new(config.server_url.clone(), config.api_key.clone());
    client
        .push(&document_id, &snapshot, &ClientId::generate())
        .await?;

    println!("Pushed {} to {}", document_id, config.server_url);
    Ok(())
}

async fn watch_document(
    storage: LocalDocStorage,
    config: &ClientConfig,
    id: &str,
) -> Result<(), DocCommandError> {
    let document_id = DocumentId::parse(id)?;
    let store = ReplicaStore::with_storage(storage);
    let session = open_session(&store, config, &document_id).await?;

    let autosave = session.spawn_autosave(Duration::from_secs(config.autosave_secs.max(1)));
    let replica = session.replica();
    let mut changes = replica.subscribe_changes();
    let mut presence = session.adapter().presence().subscribe().await;
    let mut link = session.adapter().watch();

    print_document(&replica).await?;
    println!();
    println!("Watching {} (Ctrl-C to stop)", document_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(ChangeOrigin::Remote) | Err(RecvError::Lagged(_)) => {
                    println!();
                    print_document(&replica).await?;
                    store.persist(&document_id).await?;
                }
                Ok(ChangeOrigin::Local) => {}
                Err(RecvError::Closed) => break,
            },
            Some(update) = presence.next() => match update {
                PresenceUpdate::Changed(peer) => {
                    let name = peer.name.as_deref().unwrap_or("anonymous");
                    println!("* {} ({}) is here", name, peer.client_id);
                }
                PresenceUpdate::Left(client_id) => {
                    println!("* {} left", client_id);
                }
            },
            Ok(()) = link.changed() => {
                let state = link.borrow_and_update().state;
                println!("[{:?}]", state);
            }
        }
    }

    autosave.abort();
    store.persist(&document_id).await?;
    finish(session).await
}

#[derive(Debug)]
pub enum DocCommandError {
    InvalidId(DocumentIdError),
    Replica(ReplicaError),
    LocalStorage(LocalStorageError),
    Sync(SyncError),
    NoLocalCopy(String),
    NothingToDo,
}

impl std::fmt::Display for DocCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocCommandError::InvalidId(e) => write!(f, "{}", e),
            DocCommandError::Replica(e) => write!(f, "{}", e),
            DocCommandError::LocalStorage(e) => write!(f, "{}", e),
            DocCommandError::Sync(e) => write!(f, "{}", e),
            DocCommandError::NoLocalCopy(id) => {
                write!(f, "No local copy of {}. Open it with `docsync doc show {}` first.", id, id)
            }
            DocCommandError::NothingToDo => {
                write!(f, "Nothing to do. Pass --title, --insert, --delete or --append.")
            }
        }
    }
}

impl std::error::Error for DocCommandError {}

impl From<DocumentIdError> for DocCommandError {
    fn from(e: DocumentIdError) -> Self {
        DocCommandError::InvalidId(e)
    }
}

impl From<ReplicaError> for DocCommandError {
    fn from(e: ReplicaError) -> Self {
        DocCommandError::Replica(e)
    }
}

impl From<LocalStorageError> for DocCommandError {
    fn from(e: LocalStorageError) -> Self {
        DocCommandError::LocalStorage(e)
    }
}

impl From<SyncError> for DocCommandError {
    fn from(e: SyncError) -> Self {
        DocCommandError::Sync(e)
    }
}
