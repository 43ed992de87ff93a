//! History-cursor sync over a [`GmailTransport`]

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info, warn};
use rayon::prelude::*;

use super::GmailTransport;
use crate::error::ProviderError;
use crate::models::{Checkpoint, ProviderKind};
use crate::providers::{Enumeration, FetchResult, FetchedMessage, MailProvider, RetryPolicy};

/// What the last enumeration produced
struct Listing {
    ids: Vec<String>,
    /// Cursor that becomes the checkpoint once every id is settled
    frontier: String,
}

pub struct GmailProvider<T: GmailTransport> {
    account: String,
    transport: T,
    pool: Option<rayon::ThreadPool>,
    label_names: HashMap<String, String>,
    listing: Option<Listing>,
}

impl<T: GmailTransport> GmailProvider<T> {
    pub fn new(account: impl Into<String>, transport: T, fetch_workers: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(fetch_workers.max(1))
            .thread_name(|i| format!("gmail-fetch-{}", i))
            .build()
            .map_err(|e| warn!("Falling back to sequential fetch: {}", e))
            .ok();

        Self {
            account: account.into(),
            transport,
            pool,
            label_names: HashMap::new(),
            listing: None,
        }
    }

    /// Every message id, oldest first
    ///
    /// The history id is read before paging so anything arriving during the
    /// listing is picked up by the next delta.
    fn full_listing(&self) -> Result<(Vec<String>, String), ProviderError> {
        let frontier = self.transport.current_history_id()?;

        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.transport.list_messages(page_token.as_deref())?;
            ids.extend(page.ids.into_iter().filter(|id| seen.insert(id.clone())));
            debug!("{}: listed {} messages so far", self.account, ids.len());

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        // the API lists newest first
        ids.reverse();
        Ok((ids, frontier))
    }

    fn delta_listing(&self, cursor: &str) -> Result<(Vec<String>, String), ProviderError> {
        let mut frontier = cursor.to_string();
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.transport.list_history(cursor, page_token.as_deref())?;
            ids.extend(page.added.into_iter().filter(|id| seen.insert(id.clone())));
            if let Some(history_id) = page.history_id {
                frontier = history_id;
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok((ids, frontier))
    }

    fn load_label_names(&mut self) {
        if !self.label_names.is_empty() {
            return;
        }
        match self.transport.list_labels() {
            Ok(labels) => self.label_names = labels.into_iter().collect(),
            Err(e) => warn!("{}: could not load label names, using ids: {}", self.account, e),
        }
    }

    fn label_name(&self, label_id: &str) -> String {
        self.label_names
            .get(label_id)
            .map(String::as_str)
            .unwrap_or(label_id)
            .to_string()
    }

    fn fetch_one(&self, id: &str) -> Result<FetchedMessage, ProviderError> {
        let message = self.transport.get_raw(id)?;
        let labels = message
            .label_ids
            .iter()
            .map(|label| self.label_name(label))
            .collect();

        Ok(FetchedMessage {
            provider_id: id.to_string(),
            raw: message.raw,
            labels,
        })
    }
}

impl<T: GmailTransport> MailProvider for GmailProvider<T> {
    fn account(&self) -> &str {
        &self.account
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    fn authenticate(&mut self) -> Result<(), ProviderError> {
        self.transport.authenticate()
    }

    fn enumerate_new(&mut self, checkpoint: Option<&Checkpoint>) -> Result<Enumeration, ProviderError> {
        let (ids, frontier, full) = match checkpoint {
            None => {
                let (ids, frontier) = self.full_listing()?;
                (ids, frontier, true)
            }
            Some(Checkpoint::HistoryCursor { cursor }) => {
                let (ids, frontier) = self.delta_listing(cursor)?;
                (ids, frontier, false)
            }
            Some(Checkpoint::FolderUids { .. }) => {
                warn!("{}: stored checkpoint is not a history cursor", self.account);
                return Err(ProviderError::CheckpointExpired);
            }
        };

        info!(
            "{}: {} listing found {} candidate messages",
            self.account,
            if full { "full" } else { "delta" },
            ids.len()
        );

        self.load_label_names();
        self.listing = Some(Listing {
            ids: ids.clone(),
            frontier,
        });

        Ok(Enumeration {
            ids,
            labels: HashMap::new(),
            full,
        })
    }

    fn fetch(&mut self, provider_id: &str) -> Result<FetchedMessage, ProviderError> {
        self.fetch_one(provider_id)
    }

    fn current_labels(&mut self, provider_id: &str) -> Result<BTreeSet<String>, ProviderError> {
        self.load_label_names();
        let label_ids = self.transport.get_label_ids(provider_id)?;
        Ok(label_ids.iter().map(|label| self.label_name(label)).collect())
    }

    fn fetch_batch(&mut self, ids: &[String], retry: &RetryPolicy) -> Vec<FetchResult> {
        let this = &*self;
        let run = || {
            ids.par_iter()
                .map(|id| {
                    let result = retry.run(&format!("fetch {}", id), || this.fetch_one(id));
                    (id.clone(), result)
                })
                .collect()
        };

        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    /// The cursor only moves once every listed id is settled; a partial run
    /// keeps the previous checkpoint and relies on the already-indexed skip.
    fn checkpoint_through(&self, settled: &HashSet<String>) -> Option<Checkpoint> {
        let listing = self.listing.as_ref()?;
        if listing.ids.iter().all(|id| settled.contains(id)) {
            Some(Checkpoint::cursor(listing.frontier.clone()))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientKind;
    use crate::providers::gmail::{HistoryPage, MessagePage, RawMessage};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeGmail {
        history_id: String,
        pages: Vec<Vec<&'static str>>,
        history: Option<Vec<&'static str>>,
        flaky: Mutex<HashMap<String, usize>>,
        list_calls: AtomicUsize,
    }

    impl GmailTransport for FakeGmail {
        fn authenticate(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        fn current_history_id(&self) -> Result<String, ProviderError> {
            Ok(self.history_id.clone())
        }

        fn list_messages(&self, page_token: Option<&str>) -> Result<MessagePage, ProviderError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let page: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
            Ok(MessagePage {
                ids: self.pages[page].iter().map(|s| s.to_string()).collect(),
                next_page_token: (page + 1 < self.pages.len()).then(|| (page + 1).to_string()),
            })
        }

        fn list_history(&self, _start: &str, _page: Option<&str>) -> Result<HistoryPage, ProviderError> {
            match &self.history {
                Some(added) => Ok(HistoryPage {
                    added: added.iter().map(|s| s.to_string()).collect(),
                    history_id: Some("h9".into()),
                    next_page_token: None,
                }),
                None => Err(ProviderError::CheckpointExpired),
            }
        }

        fn get_raw(&self, id: &str) -> Result<RawMessage, ProviderError> {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(id)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(ProviderError::transient(TransientKind::Unavailable, "503"));
            }
            if id == "gone" {
                return Err(ProviderError::NotFound(id.into()));
            }
            Ok(RawMessage {
                raw: format!("Subject: {}\r\n\r\nbody", id).into_bytes(),
                label_ids: vec!["INBOX".into(), "Label_7".into()],
            })
        }

        fn list_labels(&self) -> Result<Vec<(String, String)>, ProviderError> {
            Ok(vec![
                ("INBOX".into(), "INBOX".into()),
                ("Label_7".into(), "Receipts".into()),
            ])
        }
    }

    #[test]
    fn test_full_listing_pages_oldest_first() {
        let fake = FakeGmail {
            history_id: "h3".into(),
            pages: vec![vec!["m3", "m2"], vec!["m1"]],
            ..Default::default()
        };
        let mut provider = GmailProvider::new("a@x.com", fake, 2);
        let listing = provider.enumerate_new(None).unwrap();
        assert_eq!(listing.ids, vec!["m1", "m2", "m3"]);
        assert!(listing.full);
    }

    #[test]
    fn test_checkpoint_only_after_everything_settles() {
        let fake = FakeGmail {
            history_id: "h3".into(),
            pages: vec![vec!["m2", "m1"]],
            ..Default::default()
        };
        let mut provider = GmailProvider::new("a@x.com", fake, 1);
        provider.enumerate_new(None).unwrap();

        let mut settled = HashSet::from(["m1".to_string()]);
        assert_eq!(provider.checkpoint_through(&settled), None);
        settled.insert("m2".to_string());
        assert_eq!(provider.checkpoint_through(&settled), Some(Checkpoint::cursor("h3")));
    }

    #[test]
    fn test_delta_listing_advances_to_latest_history_id() {
        let fake = FakeGmail {
            history: Some(vec!["m4", "m5", "m4"]),
            ..Default::default()
        };
        let mut provider = GmailProvider::new("a@x.com", fake, 1);
        let listing = provider.enumerate_new(Some(&Checkpoint::cursor("h3"))).unwrap();
        assert_eq!(listing.ids, vec!["m4", "m5"]);
        assert!(!listing.full);

        let settled = HashSet::from(["m4".to_string(), "m5".to_string()]);
        assert_eq!(provider.checkpoint_through(&settled), Some(Checkpoint::cursor("h9")));
    }

    #[test]
    fn test_current_labels_use_label_names() {
        let mut provider = GmailProvider::new("a@x.com", FakeGmail::default(), 1);
        let labels: Vec<_> = provider.current_labels("m1").unwrap().into_iter().collect();
        assert_eq!(labels, vec!["INBOX", "Receipts"]);
        assert!(matches!(
            provider.current_labels("gone"),
            Err(ProviderError::NotFound(_))
        ));
    }

    #[test]
    fn test_expired_cursor_is_reported() {
        let mut provider = GmailProvider::new("a@x.com", FakeGmail::default(), 1);
        assert_eq!(
            provider.enumerate_new(Some(&Checkpoint::cursor("h1"))).unwrap_err(),
            ProviderError::CheckpointExpired
        );
    }

    #[test]
    fn test_fetch_batch_retries_and_keeps_order() {
        let fake = FakeGmail {
            history_id: "h1".into(),
            pages: vec![vec!["m1"]],
            ..Default::default()
        };
        fake.flaky.lock().unwrap().insert("m2".into(), 2);
        let mut provider = GmailProvider::new("a@x.com", fake, 4);
        provider.enumerate_new(None).unwrap();

        let ids: Vec<String> = ["m1", "m2", "gone", "m3"].iter().map(|s| s.to_string()).collect();
        let results = provider.fetch_batch(&ids, &RetryPolicy::immediate(3));

        let order: Vec<_> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["m1", "m2", "gone", "m3"]);
        assert!(results[1].1.is_ok());
        assert!(matches!(results[2].1, Err(ProviderError::NotFound(_))));

        let fetched = results[0].1.as_ref().unwrap();
        assert_eq!(fetched.labels, vec!["INBOX", "Receipts"]);
    }
}
