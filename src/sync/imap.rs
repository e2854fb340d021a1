use async_imap::types::{Name, NameAttribute};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::error::{Result, SyncError};
use log::{info, warn};

pub type ImapSession = Session<Compat<tokio_native_tls::TlsStream<TcpStream>>>;

/// Establish a TLS-encrypted connection and log in. TCP, TLS, and timeout
/// failures surface as connection errors; a rejected login is a credential
/// error, so the worker can record a diagnosable reason instead of retrying.
pub async fn connect(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    net_timeout: Duration,
) -> Result<ImapSession> {
    let tcp_stream = timeout(net_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| SyncError::connection(format!("connecting to {}:{} timed out", host, port)))?
        .map_err(|e| SyncError::connection(format!("cannot reach {}:{}: {}", host, port, e)))?;

    let connector = native_tls::TlsConnector::new()
        .map_err(|e| SyncError::connection(format!("TLS setup failed: {}", e)))?;
    let tls = tokio_native_tls::TlsConnector::from(connector);
    let tls_stream = timeout(net_timeout, tls.connect(host, tcp_stream))
        .await
        .map_err(|_| SyncError::connection(format!("TLS handshake with {} timed out", host)))?
        .map_err(|e| SyncError::connection(format!("TLS handshake with {} failed: {}", host, e)))?;

    info!("-- connected to {}:{}", host, port);

    let client = Client::new(tls_stream.compat());
    let session = timeout(net_timeout, client.login(username, password))
        .await
        .map_err(|_| SyncError::connection("login timed out".to_string()))?
        .map_err(|e| SyncError::credential(format!("login rejected for {}: {}", username, e.0)))?;

    info!("-- logged in as {}", username);
    Ok(session)
}

/// List mailbox paths, skipping pure container folders the server flags as
/// non-selectable.
pub async fn list_selectable_mailboxes(
    session: &mut ImapSession,
    net_timeout: Duration,
) -> Result<Vec<String>> {
    let list = async {
        let stream = session.list(Some(""), Some("*")).await?;
        let names: Vec<Name> = stream.try_collect().await?;
        Ok::<_, async_imap::error::Error>(names)
    };
    let names = timeout(net_timeout, list)
        .await
        .map_err(|_| SyncError::connection("mailbox listing timed out".to_string()))?
        .map_err(|e| SyncError::connection(format!("mailbox listing failed: {}", e)))?;

    Ok(names
        .iter()
        .filter(|name| {
            !name
                .attributes()
                .iter()
                .any(|attr| matches!(attr, NameAttribute::NoSelect))
        })
        .map(|name| name.name().to_string())
        .collect())
}

/// Server-side enumeration of every message identifier currently in the
/// mailbox, ascending.
pub async fn list_message_uids(
    session: &mut ImapSession,
    mailbox: &str,
    net_timeout: Duration,
) -> Result<Vec<u32>> {
    let search = async {
        session.select(mailbox).await?;
        session.uid_search("ALL").await
    };
    let found = timeout(net_timeout, search)
        .await
        .map_err(|_| SyncError::connection(format!("listing {} timed out", mailbox)))?
        .map_err(|e| SyncError::connection(format!("listing {} failed: {}", mailbox, e)))?;

    let mut uids: Vec<u32> = found.into_iter().collect();
    uids.sort_unstable();
    info!("-- {} selected, {} messages on server", mailbox, uids.len());
    Ok(uids)
}

/// Fetch raw message bytes for the given identifiers. Identifiers the
/// server no longer has simply produce no entry.
pub async fn fetch_raw(
    session: &mut ImapSession,
    mailbox: &str,
    uids: &[u32],
    net_timeout: Duration,
) -> Result<Vec<(u32, Vec<u8>)>> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    let uid_set = uids
        .iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let fetch = async {
        session.select(mailbox).await?;
        let stream = session.uid_fetch(&uid_set, "(UID BODY.PEEK[])").await?;
        let fetches: Vec<_> = stream.try_collect().await?;
        Ok::<_, async_imap::error::Error>(fetches)
    };
    let fetches = timeout(net_timeout, fetch)
        .await
        .map_err(|_| SyncError::connection(format!("fetching from {} timed out", mailbox)))?
        .map_err(|e| SyncError::connection(format!("fetching from {} failed: {}", mailbox, e)))?;

    let mut raw = Vec::with_capacity(fetches.len());
    for fetch in &fetches {
        let uid = match fetch.uid {
            Some(uid) => uid,
            None => continue,
        };
        if let Some(body) = fetch.body() {
            raw.push((uid, body.to_vec()));
        } else {
            warn!("server returned no body for {}/{}", mailbox, uid);
        }
    }
    Ok(raw)
}

/// Be nice to the server and log out. Called on every exit path; a failed
/// logout is not worth failing a job over.
pub async fn close(mut session: ImapSession) {
    if let Err(e) = session.logout().await {
        warn!("imap logout failed: {}", e);
    }
}
