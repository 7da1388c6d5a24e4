//! Async IMAP Client Implementation using async-imap
//!
//! One [`AsyncImapClient`] wraps one authenticated session. Plain and TLS
//! transports share a boxed stream so the session type stays uniform.

use std::borrow::Cow;
use std::fmt::Debug;

use async_imap::types::{Fetch, Flag};
use async_imap::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{pin_mut, stream, AsyncRead, AsyncWrite, StreamExt};
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::mail::{
    Account, FetchRange, FetchRequest, FetchStream, Folder, MailError, MailResult,
    MailboxConnector, MailboxSession, Message, SearchQuery, SecurityType,
};

/// Byte stream an IMAP session can run over
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T> ImapStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

type BoxedStream = Box<dyn ImapStream>;

/// SECURITY: Sanitize a flag keyword before it is placed in a STORE command
fn sanitize_flag(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '\\' | '$' | '_' | '-' | '.'))
        .collect()
}

/// SECURITY: Sanitize folder name for IMAP operations
fn sanitize_folder_name(folder: &str) -> String {
    // Allow standard folder characters but remove injection vectors
    folder
        .chars()
        .filter(|c| {
            c.is_alphanumeric()
                || *c == '/'
                || *c == '.'
                || *c == '-'
                || *c == '_'
                || *c == '['
                || *c == ']'
                || *c == ' '
        })
        .collect()
}

/// Decode MIME encoded header (RFC 2047)
fn decode_mime_header(input: &str) -> String {
    if !input.contains("=?") {
        return input.to_string();
    }

    let mut result = input.to_string();

    // =?charset?B?text?=
    if let Ok(re_b64) = regex_lite::Regex::new(r"=\?([^?]+)\?[Bb]\?([^?]+)\?=") {
        result = re_b64
            .replace_all(&result, |caps: &regex_lite::Captures| {
                let encoded = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .unwrap_or_else(|| encoded.to_string())
            })
            .to_string();
    }

    // =?charset?Q?text?=
    if let Ok(re_qp) = regex_lite::Regex::new(r"=\?([^?]+)\?[Qq]\?([^?]+)\?=") {
        result = re_qp
            .replace_all(&result, |caps: &regex_lite::Captures| {
                let encoded = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                decode_quoted_printable(encoded)
            })
            .to_string();
    }

    result
}

fn decode_quoted_printable(input: &str) -> String {
    let mut result = Vec::new();
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '=' => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    result.push(byte);
                }
            }
            '_' => result.push(b' '),
            other => {
                let mut buf = [0u8; 4];
                result.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }

    String::from_utf8(result).unwrap_or_else(|_| input.to_string())
}

/// Longest UID set sent in a single command. Servers commonly cap command
/// lines at 8 KB.
const MAX_UID_SET_LEN: usize = 4000;

fn uid_run(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

/// UID sets for UID commands. Consecutive UIDs collapse to `a:b` and the
/// result is split so no set exceeds [`MAX_UID_SET_LEN`].
fn uid_sets(uids: &[u32]) -> Vec<String> {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs = Vec::new();
    let mut iter = sorted.into_iter();
    if let Some(first) = iter.next() {
        let (mut start, mut end) = (first, first);
        for uid in iter {
            if end.checked_add(1) == Some(uid) {
                end = uid;
            } else {
                runs.push(uid_run(start, end));
                start = uid;
                end = uid;
            }
        }
        runs.push(uid_run(start, end));
    }

    let mut sets = Vec::new();
    let mut current = String::new();
    for run in runs {
        if !current.is_empty() && current.len() + 1 + run.len() > MAX_UID_SET_LEN {
            sets.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(',');
        }
        current.push_str(&run);
    }
    if !current.is_empty() {
        sets.push(current);
    }
    sets
}

/// IMAP SEARCH criteria for a date window.
///
/// Age predicates look at the Date header, so the search uses the SENT*
/// keys and widens each bound by a day to cover header time zones. The
/// result may hold extra candidates but never misses one.
fn search_criteria(query: &SearchQuery) -> String {
    let mut parts = Vec::new();
    if let Some(before) = query.before {
        let before = before.succ_opt().unwrap_or(before);
        parts.push(format!("SENTBEFORE {}", before.format("%d-%b-%Y")));
    }
    if let Some(since) = query.since {
        let since = since.pred_opt().unwrap_or(since);
        parts.push(format!("SENTSINCE {}", since.format("%d-%b-%Y")));
    }
    if parts.is_empty() {
        "ALL".to_string()
    } else {
        parts.join(" ")
    }
}

/// Sequence range covering the `limit` newest messages of a folder
fn latest_range(exists: u32, limit: u32) -> Option<String> {
    if exists == 0 {
        return None;
    }
    let start = exists.saturating_sub(limit) + 1;
    Some(format!("{}:{}", start, exists))
}

fn lossy(bytes: &Option<Cow<'_, [u8]>>) -> String {
    bytes
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).to_string())
        .unwrap_or_default()
}

fn format_address(addr: &imap_proto::types::Address<'_>) -> String {
    let mailbox = lossy(&addr.mailbox);
    let host = lossy(&addr.host);
    let email = format!("{}@{}", mailbox, host);
    match addr.name.as_ref() {
        Some(name) => {
            let name = decode_mime_header(&String::from_utf8_lossy(name));
            format!("{} <{}>", name, email)
        }
        None => email,
    }
}

fn extract_flags(fetch: &Fetch) -> Vec<String> {
    fetch
        .flags()
        .map(|f| match f {
            Flag::Seen => "\\Seen".to_string(),
            Flag::Answered => "\\Answered".to_string(),
            Flag::Flagged => "\\Flagged".to_string(),
            Flag::Deleted => "\\Deleted".to_string(),
            Flag::Draft => "\\Draft".to_string(),
            Flag::Recent => "\\Recent".to_string(),
            Flag::MayCreate => "\\*".to_string(),
            Flag::Custom(c) => c.to_string(),
            #[allow(unreachable_patterns)]
            other => format!("{:?}", other),
        })
        .collect()
}

/// Walk a BODYSTRUCTURE tree looking for parts that are attachments.
/// Inline parts carrying a Content-ID are embedded resources, not attachments.
fn has_attachment(bs: &imap_proto::types::BodyStructure<'_>) -> bool {
    use imap_proto::types::BodyStructure;
    match bs {
        BodyStructure::Multipart { bodies, .. } => bodies.iter().any(has_attachment),
        BodyStructure::Basic { common, other, .. }
        | BodyStructure::Text { common, other, .. }
        | BodyStructure::Message { common, other, .. } => {
            if let Some(ref disp) = common.disposition {
                if disp.ty.eq_ignore_ascii_case("attachment") {
                    return true;
                }
            }

            if common.ty.ty.eq_ignore_ascii_case("text")
                || common.ty.ty.eq_ignore_ascii_case("multipart")
            {
                return false;
            }

            if let BodyStructure::Message { body, .. } = bs {
                return has_attachment(body);
            }

            let inline = common
                .disposition
                .as_ref()
                .map(|d| d.ty.eq_ignore_ascii_case("inline"))
                .unwrap_or(false);
            !(inline && other.id.is_some())
        }
    }
}

fn message_from_fetch(fetch: &Fetch) -> MailResult<Message> {
    let uid = fetch
        .uid
        .ok_or_else(|| MailError::Protocol("FETCH response without UID".to_string()))?;

    let internal_date = fetch.internal_date().map(|d| d.with_timezone(&Utc));

    let (from, to, subject, envelope_date) = match fetch.envelope() {
        Some(envelope) => {
            let from = envelope
                .from
                .as_ref()
                .map(|addrs| addrs.iter().map(format_address).collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            let to = envelope
                .to
                .as_ref()
                .map(|addrs| addrs.iter().map(format_address).collect())
                .unwrap_or_default();
            let subject = envelope
                .subject
                .as_ref()
                .map(|s| decode_mime_header(&String::from_utf8_lossy(s)))
                .unwrap_or_default();
            let date = envelope
                .date
                .as_ref()
                .and_then(|d| DateTime::parse_from_rfc2822(String::from_utf8_lossy(d).trim()).ok())
                .map(|d| d.with_timezone(&Utc));
            (from, to, subject, date)
        }
        None => (String::new(), Vec::new(), String::new(), None),
    };

    Ok(Message {
        uid,
        sequence_number: fetch.message,
        from,
        to,
        subject,
        date: envelope_date.or(internal_date).unwrap_or_default(),
        flags: extract_flags(fetch),
        size: fetch.size.map(u64::from).unwrap_or(0),
        has_attachment: fetch.bodystructure().map(has_attachment).unwrap_or(false),
        matched_rule: None,
    })
}

fn protocol(e: async_imap::error::Error) -> MailError {
    MailError::Protocol(e.to_string())
}

/// A NO answer to STORE means the folder refuses writes
fn store_error(folder: &str, e: async_imap::error::Error) -> MailError {
    match e {
        async_imap::error::Error::No(msg) => MailError::ReadOnly(format!("{}: {}", folder, msg)),
        other => protocol(other),
    }
}

/// Async IMAP Client wrapper
pub struct AsyncImapClient {
    session: Option<Session<BoxedStream>>,
    account_name: String,
    selected: Option<String>,
    exists: u32,
}

impl AsyncImapClient {
    /// Connect and authenticate
    pub async fn connect(account: &Account) -> MailResult<Self> {
        let address = account.address();
        log::info!("Connecting to IMAP server {} for {}", address, account.name);

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| MailError::Connection(format!("{}: {}", address, e)))?;

        let stream: BoxedStream = match account.security() {
            SecurityType::Tls => {
                let tls_stream = async_native_tls::TlsConnector::new()
                    .connect(&account.host, stream.compat())
                    .await
                    .map_err(|e| MailError::Connection(e.to_string()))?;
                Box::new(tls_stream)
            }
            SecurityType::Plain => {
                log::warn!("Connecting to {} without TLS", address);
                Box::new(stream.compat())
            }
        };

        let client = async_imap::Client::new(stream);
        let session = client
            .login(&account.username, &account.password)
            .await
            .map_err(|e| MailError::Authentication(e.0.to_string()))?;

        log::info!("Logged in as {}", account.username);

        Ok(Self {
            session: Some(session),
            account_name: account.name.clone(),
            selected: None,
            exists: 0,
        })
    }

    fn session(&mut self) -> MailResult<&mut Session<BoxedStream>> {
        self.session.as_mut().ok_or(MailError::NotConnected)
    }

    /// Folder-scoped commands default to INBOX when nothing was selected yet
    async fn ensure_selected(&mut self) -> MailResult<()> {
        if self.selected.is_none() {
            self.select_folder("INBOX").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxSession for AsyncImapClient {
    async fn list_folders(&mut self) -> MailResult<Vec<Folder>> {
        let session = self.session()?;

        let mut names = session.list(Some(""), Some("*")).await.map_err(protocol)?;

        let mut folders = Vec::new();
        while let Some(result) = names.next().await {
            let name = result.map_err(protocol)?;
            folders.push(Folder {
                name: name.name().to_string(),
                delimiter: name.delimiter().unwrap_or("/").to_string(),
                attributes: name
                    .attributes()
                    .iter()
                    .map(|attr| format!("{:?}", attr))
                    .collect(),
            });
        }

        Ok(folders)
    }

    async fn select_folder(&mut self, name: &str) -> MailResult<u32> {
        let safe_folder = sanitize_folder_name(name);
        let session = self.session()?;

        log::info!("Selecting folder: {}", safe_folder);
        let mailbox = session.select(&safe_folder).await.map_err(|e| match e {
            async_imap::error::Error::No(_) => MailError::FolderNotFound(name.to_string()),
            other => protocol(other),
        })?;

        log::info!("Folder selected, {} messages exist", mailbox.exists);
        self.selected = Some(safe_folder);
        self.exists = mailbox.exists;
        Ok(mailbox.exists)
    }

    async fn fetch<'a>(&'a mut self, request: FetchRequest) -> MailResult<FetchStream<'a>> {
        self.ensure_selected().await?;
        let exists = self.exists;
        let query = request.fields.imap_query();
        let session = self.session()?;

        let responses = match request.range {
            FetchRange::Uids(uids) => {
                let mut sets = uid_sets(&uids);
                match sets.len() {
                    0 => return Ok(stream::empty().boxed()),
                    1 => session
                        .uid_fetch(sets.remove(0), &query)
                        .await
                        .map_err(protocol)?
                        .boxed(),
                    n => {
                        // One command at a time: each response stream is drained before the next
                        log::debug!("Fetching {} UIDs in {} commands", uids.len(), n);
                        let mut fetched = Vec::with_capacity(uids.len());
                        for set in sets {
                            let responses = session.uid_fetch(set, &query).await.map_err(protocol)?;
                            pin_mut!(responses);
                            while let Some(item) = responses.next().await {
                                fetched.push(item);
                            }
                        }
                        stream::iter(fetched).boxed()
                    }
                }
            }
            FetchRange::All => {
                if exists == 0 {
                    return Ok(stream::empty().boxed());
                }
                session.fetch("1:*", &query).await.map_err(protocol)?.boxed()
            }
            FetchRange::Latest(limit) => match latest_range(exists, limit) {
                Some(range) => {
                    log::info!("Fetching range: {}", range);
                    session.fetch(range, &query).await.map_err(protocol)?.boxed()
                }
                None => return Ok(stream::empty().boxed()),
            },
        };

        Ok(responses
            .map(|result| result.map_err(protocol).and_then(|fetch| message_from_fetch(&fetch)))
            .boxed())
    }

    async fn search(&mut self, query: SearchQuery) -> MailResult<Vec<u32>> {
        self.ensure_selected().await?;
        let criteria = search_criteria(&query);
        let session = self.session()?;

        log::debug!("UID SEARCH {}", criteria);
        let found = session.uid_search(&criteria).await.map_err(protocol)?;
        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn set_flags(&mut self, uids: &[u32], flags: &[String], add: bool) -> MailResult<()> {
        if uids.is_empty() || flags.is_empty() {
            return Ok(());
        }
        self.ensure_selected().await?;

        let flag_list = flags
            .iter()
            .map(|f| sanitize_flag(f))
            .collect::<Vec<_>>()
            .join(" ");
        let flag_cmd = format!("{}FLAGS.SILENT ({})", if add { "+" } else { "-" }, flag_list);
        let folder = self.selected.clone().unwrap_or_default();
        let session = self.session()?;

        for set in uid_sets(uids) {
            let mut responses = session
                .uid_store(set, &flag_cmd)
                .await
                .map_err(|e| store_error(&folder, e))?;
            while let Some(result) = responses.next().await {
                result.map_err(|e| store_error(&folder, e))?;
            }
        }
        Ok(())
    }

    async fn copy(&mut self, uids: &[u32], destination: &str) -> MailResult<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.ensure_selected().await?;
        let target = sanitize_folder_name(destination);
        let session = self.session()?;

        for set in uid_sets(uids) {
            session.uid_copy(set, &target).await.map_err(|e| match e {
                async_imap::error::Error::No(_) => MailError::FolderNotFound(destination.to_string()),
                other => protocol(other),
            })?;
        }
        Ok(())
    }

    async fn expunge(&mut self) -> MailResult<()> {
        self.ensure_selected().await?;
        let session = self.session()?;

        let mut removed = 0u32;
        {
            let expunge_stream = session.expunge().await.map_err(protocol)?;
            pin_mut!(expunge_stream);
            while let Some(result) = expunge_stream.next().await {
                result.map_err(protocol)?;
                removed += 1;
            }
        }

        self.exists = self.exists.saturating_sub(removed);
        log::debug!("Expunged {} messages for {}", removed, self.account_name);
        Ok(())
    }

    async fn create_folder(&mut self, name: &str) -> MailResult<()> {
        let safe_folder = sanitize_folder_name(name);
        let session = self.session()?;
        session.create(&safe_folder).await.map_err(protocol)
    }

    async fn logout(&mut self) -> MailResult<()> {
        if let Some(mut session) = self.session.take() {
            session.logout().await.map_err(protocol)?;
        }
        self.selected = None;
        Ok(())
    }
}

/// Connector for real IMAP servers
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self, account: &Account) -> MailResult<Box<dyn MailboxSession>> {
        let client = AsyncImapClient::connect(account).await?;
        Ok(Box::new(client))
    }
}
