//! IMAP provider: per-folder UID sync
//!
//! Every selectable folder is examined read-only. The checkpoint keeps the
//! highest contiguous settled UID per folder together with the folder's
//! UIDVALIDITY; a validity change resets that folder to a full rescan.
//! A message filed in several folders (same Message-ID) is archived once
//! and carries every folder name as a label.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::TcpStream;
use std::sync::Arc;

use imap::types::NameAttribute;
use log::{debug, info};

use crate::error::{ProviderError, TransientKind};
use crate::identity::{DedupArena, Observation, normalize_message_id};
use crate::models::{Checkpoint, FolderMark, ImapSettings, ProviderKind};
use crate::parser::headers;
use crate::providers::{Enumeration, FetchedMessage, MailProvider};
use crate::secrets::{SecretStore, imap_password_key};

/// UIDs whose headers are fetched per round trip while listing
const HEADER_BATCH: usize = 50;

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    pub name: String,
    /// False for `\Noselect` containers
    pub selectable: bool,
}

/// Commands the provider issues against one authenticated session
pub trait ImapConnection: Send {
    fn list_folders(&mut self) -> Result<Vec<FolderInfo>, ProviderError>;

    /// EXAMINE a folder, returning its UIDVALIDITY
    fn examine(&mut self, folder: &str) -> Result<u32, ProviderError>;

    /// UIDs above `uid` in the examined folder (may include `uid` itself
    /// when the folder is otherwise empty above it)
    fn uids_above(&mut self, uid: u32) -> Result<Vec<u32>, ProviderError>;

    /// Message-ID header values for the given UIDs, where present
    fn message_ids(&mut self, uids: &[u32]) -> Result<HashMap<u32, String>, ProviderError>;

    /// Raw bytes of one message without setting `\Seen`
    fn fetch_raw(&mut self, uid: u32) -> Result<Option<Vec<u8>>, ProviderError>;
}

/// TLS session backed by the `imap` crate
pub struct NativeImapConnection {
    session: ImapSession,
}

impl NativeImapConnection {
    pub fn connect(host: &str, port: u16, username: &str, password: &str) -> Result<Self, ProviderError> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| ProviderError::Config(format!("TLS connector build failed: {}", e)))?;

        let client = imap::connect((host, port), host, &tls).map_err(|e| imap_error(e, "connect"))?;
        let session = client.login(username, password).map_err(|e| match e.0 {
            imap::Error::No(message) | imap::Error::Bad(message) => {
                ProviderError::Auth(format!("IMAP login for {} rejected: {}", username, message))
            }
            other => imap_error(other, "login"),
        })?;

        debug!("IMAP session open to {}:{} as {}", host, port, username);
        Ok(Self { session })
    }
}

impl ImapConnection for NativeImapConnection {
    fn list_folders(&mut self) -> Result<Vec<FolderInfo>, ProviderError> {
        let names = self
            .session
            .list(Some(""), Some("*"))
            .map_err(|e| imap_error(e, "LIST"))?;

        Ok(names
            .iter()
            .map(|name| FolderInfo {
                name: name.name().to_string(),
                selectable: !name
                    .attributes()
                    .iter()
                    .any(|attr| matches!(attr, NameAttribute::NoSelect)),
            })
            .collect())
    }

    fn examine(&mut self, folder: &str) -> Result<u32, ProviderError> {
        let mailbox = self
            .session
            .examine(folder)
            .map_err(|e| imap_error(e, &format!("EXAMINE {}", folder)))?;
        mailbox
            .uid_validity
            .ok_or_else(|| ProviderError::Malformed(format!("{} reported no UIDVALIDITY", folder)))
    }

    fn uids_above(&mut self, uid: u32) -> Result<Vec<u32>, ProviderError> {
        let query = format!("UID {}:*", uid.saturating_add(1));
        let uids = self
            .session
            .uid_search(&query)
            .map_err(|e| imap_error(e, "UID SEARCH"))?;
        Ok(uids.into_iter().collect())
    }

    fn message_ids(&mut self, uids: &[u32]) -> Result<HashMap<u32, String>, ProviderError> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }
        let set = uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",");
        let fetches = self
            .session
            .uid_fetch(&set, "(UID RFC822.HEADER)")
            .map_err(|e| imap_error(e, "UID FETCH headers"))?;

        let mut ids = HashMap::new();
        for fetch in fetches.iter() {
            let (Some(uid), Some(header)) = (fetch.uid, fetch.header()) else {
                continue;
            };
            let (fields, _) = headers::header_fields(header);
            if let Some(field) = headers::find(&fields, "message-id") {
                let value = normalize_message_id(&headers::decode_value(&field.value));
                if !value.is_empty() {
                    ids.insert(uid, value);
                }
            }
        }
        Ok(ids)
    }

    fn fetch_raw(&mut self, uid: u32) -> Result<Option<Vec<u8>>, ProviderError> {
        let fetches = self
            .session
            .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
            .map_err(|e| imap_error(e, &format!("UID FETCH {}", uid)))?;
        Ok(fetches
            .iter()
            .find(|f| f.uid == Some(uid))
            .and_then(|f| f.body())
            .map(<[u8]>::to_vec))
    }
}

impl Drop for NativeImapConnection {
    fn drop(&mut self) {
        let _ = self.session.logout();
    }
}

fn imap_error(err: imap::Error, what: &str) -> ProviderError {
    match err {
        imap::Error::Io(e) => {
            ProviderError::transient(TransientKind::ConnectionReset, format!("{}: {}", what, e))
        }
        imap::Error::ConnectionLost => ProviderError::transient(
            TransientKind::ConnectionReset,
            format!("{}: connection lost", what),
        ),
        imap::Error::No(message) => ProviderError::NotFound(format!("{}: {}", what, message)),
        imap::Error::Bad(message) => ProviderError::Malformed(format!("{}: {}", what, message)),
        imap::Error::Parse(e) => ProviderError::Malformed(format!("{}: {}", what, e)),
        other => ProviderError::transient(TransientKind::Unavailable, format!("{}: {}", what, other)),
    }
}

struct FolderListing {
    validity: u32,
    /// Mark the listing started from (0 after a validity reset)
    start_uid: u32,
    /// Listed UIDs, ascending
    uids: Vec<u32>,
}

struct ImapListing {
    base: BTreeMap<String, FolderMark>,
    folders: BTreeMap<String, FolderListing>,
    arena: DedupArena,
}

impl ImapListing {
    fn is_settled(&self, provider_id: &str, settled: &HashSet<String>) -> bool {
        if settled.contains(provider_id) {
            return true;
        }
        // folded copies settle with the message that owns them
        self.arena
            .canonical_for(provider_id)
            .is_some_and(|owner| owner != provider_id && settled.contains(owner))
    }
}

type Connector<C> = Box<dyn FnMut() -> Result<C, ProviderError> + Send>;

pub struct ImapProvider<C: ImapConnection> {
    account: String,
    settings: ImapSettings,
    connect: Connector<C>,
    session: Option<C>,
    /// Currently examined folder and its validity
    selected: Option<(String, u32)>,
    listing: Option<ImapListing>,
}

impl ImapProvider<NativeImapConnection> {
    /// Provider that logs in with the password stored under `imap-password/<address>`
    pub fn native(account: String, settings: ImapSettings, secrets: Arc<dyn SecretStore>) -> Self {
        let address = account.clone();
        let server = settings.clone();
        Self::new(account, settings, move || {
            let password = secrets
                .get_string(&imap_password_key(&address))
                .map_err(|e| ProviderError::Config(format!("{:#}", e)))?
                .ok_or_else(|| ProviderError::Auth(format!("no IMAP password stored for {}", address)))?;
            let username = server.username.as_deref().unwrap_or(&address);
            NativeImapConnection::connect(&server.host, server.port, username, &password)
        })
    }
}

impl<C: ImapConnection> ImapProvider<C> {
    pub fn new(
        account: impl Into<String>,
        settings: ImapSettings,
        connect: impl FnMut() -> Result<C, ProviderError> + Send + 'static,
    ) -> Self {
        Self {
            account: account.into(),
            settings,
            connect: Box::new(connect),
            session: None,
            selected: None,
            listing: None,
        }
    }

    /// Run a command on the session, connecting first if needed
    ///
    /// A transient failure drops the session so the next call reconnects.
    fn with_session<T>(
        &mut self,
        op: impl FnOnce(&mut C) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                self.selected = None;
                (self.connect)()?
            }
        };

        let result = op(&mut session);
        match &result {
            Err(e) if e.is_retriable() => {
                debug!("{}: dropping IMAP session after {}", self.account, e);
                self.selected = None;
            }
            _ => self.session = Some(session),
        }
        result
    }

    fn examine(&mut self, folder: &str) -> Result<u32, ProviderError> {
        if let Some((name, validity)) = &self.selected
            && name == folder
        {
            return Ok(*validity);
        }
        let validity = self.with_session(|s| s.examine(folder))?;
        self.selected = Some((folder.to_string(), validity));
        Ok(validity)
    }
}

fn split_provider_id(provider_id: &str) -> Option<(&str, u32)> {
    let (folder, uid) = provider_id.rsplit_once(':')?;
    Some((folder, uid.parse().ok()?))
}

impl<C: ImapConnection> MailProvider for ImapProvider<C> {
    fn account(&self) -> &str {
        &self.account
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    fn authenticate(&mut self) -> Result<(), ProviderError> {
        self.with_session(|_| Ok(()))
    }

    fn enumerate_new(&mut self, checkpoint: Option<&Checkpoint>) -> Result<Enumeration, ProviderError> {
        let base = match checkpoint {
            None => BTreeMap::new(),
            Some(Checkpoint::FolderUids { folders }) => folders.clone(),
            Some(Checkpoint::HistoryCursor { .. }) => return Err(ProviderError::CheckpointExpired),
        };

        self.selected = None;
        let folders = self.with_session(|s| s.list_folders())?;
        let mut listing = ImapListing {
            base: base.clone(),
            folders: BTreeMap::new(),
            arena: DedupArena::new(),
        };
        let mut ids = Vec::new();

        for folder in folders {
            if !folder.selectable || self.settings.is_excluded(&folder.name) {
                debug!("{}: skipping folder {}", self.account, folder.name);
                continue;
            }

            let validity = self.examine(&folder.name)?;
            let start_uid = match base.get(&folder.name) {
                Some(mark) if mark.validity == validity => mark.uid,
                Some(mark) => {
                    info!(
                        "{}: UIDVALIDITY of {} changed ({} -> {}), rescanning folder",
                        self.account, folder.name, mark.validity, validity
                    );
                    0
                }
                None => 0,
            };

            let mut uids: Vec<u32> = self
                .with_session(|s| s.uids_above(start_uid))?
                .into_iter()
                .filter(|&uid| uid > start_uid)
                .collect();
            uids.sort_unstable();
            uids.dedup();

            for chunk in uids.chunks(HEADER_BATCH) {
                let message_ids = self.with_session(|s| s.message_ids(chunk))?;
                for uid in chunk {
                    let provider_id = format!("{}:{}", folder.name, uid);
                    let header = message_ids.get(uid).map(String::as_str);
                    match listing.arena.observe(&provider_id, header, &folder.name) {
                        Observation::Canonical => ids.push(provider_id),
                        Observation::Folded { canonical } => {
                            debug!("{}: {} is a copy of {}", self.account, provider_id, canonical)
                        }
                    }
                }
            }

            debug!("{}: {} has {} new messages", self.account, folder.name, uids.len());
            listing.folders.insert(
                folder.name,
                FolderListing {
                    validity,
                    start_uid,
                    uids,
                },
            );
        }

        let labels = ids
            .iter()
            .filter_map(|id| {
                listing
                    .arena
                    .labels_for(id)
                    .map(|labels| (id.clone(), labels.clone()))
            })
            .collect();

        info!(
            "{}: listed {} new messages across {} folders",
            self.account,
            ids.len(),
            listing.folders.len()
        );
        self.listing = Some(listing);

        Ok(Enumeration {
            ids,
            labels,
            full: base.is_empty(),
        })
    }

    fn fetch(&mut self, provider_id: &str) -> Result<FetchedMessage, ProviderError> {
        let (folder, uid) = split_provider_id(provider_id)
            .ok_or_else(|| ProviderError::Malformed(format!("not an IMAP message id: {}", provider_id)))?;

        let validity = self.examine(folder)?;
        if let Some(listed) = self.listing.as_ref().and_then(|l| l.folders.get(folder))
            && listed.validity != validity
        {
            return Err(ProviderError::NotFound(format!(
                "{}: UIDVALIDITY changed since listing",
                provider_id
            )));
        }

        let raw = self
            .with_session(|s| s.fetch_raw(uid))?
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))?;

        let labels = self
            .listing
            .as_ref()
            .and_then(|l| l.arena.labels_for(provider_id))
            .map(|labels| labels.iter().cloned().collect())
            .unwrap_or_else(|| vec![folder.to_string()]);

        Ok(FetchedMessage {
            provider_id: provider_id.to_string(),
            raw,
            labels,
        })
    }

    /// Folders holding the message, from the latest listing
    ///
    /// Falls back to the folder named in the provider id.
    fn current_labels(&mut self, provider_id: &str) -> Result<BTreeSet<String>, ProviderError> {
        if let Some(labels) = self.listing.as_ref().and_then(|l| l.arena.labels_for(provider_id)) {
            return Ok(labels.clone());
        }
        let (folder, _) = split_provider_id(provider_id)
            .ok_or_else(|| ProviderError::Malformed(format!("not an IMAP message id: {}", provider_id)))?;
        Ok(BTreeSet::from([folder.to_string()]))
    }

    fn checkpoint_through(&self, settled: &HashSet<String>) -> Option<Checkpoint> {
        let listing = self.listing.as_ref()?;
        let mut folders = listing.base.clone();

        for (name, folder) in &listing.folders {
            let mut uid = folder.start_uid;
            for &listed in &folder.uids {
                if !listing.is_settled(&format!("{}:{}", name, listed), settled) {
                    break;
                }
                uid = listed;
            }
            folders.insert(
                name.clone(),
                FolderMark {
                    uid,
                    validity: folder.validity,
                },
            );
        }

        Some(Checkpoint::FolderUids { folders })
    }
}
