//! Incremental sync: page through each tracked profile's content newest
//! first, persist what changed, and queue media downloads.
//!
//! Every item is handled in its own unit of work. Downloads discovered while
//! processing an item are staged and only handed to the queue after that
//! item's transaction has committed, so a download completion never waits
//! on a transaction the driver still holds.

pub mod http;
pub mod source;

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{Database, DbError, Executor};
use crate::dedup;
use crate::download::{paths, DownloadOp, DownloadQueue, PoolError};
use crate::models::{
    Content, ContentTable, Media, MediaList, MediaSlot, Messages, Posts, Profile, ProfileImage,
    Stories,
};
use crate::storage::Storage;
use crate::store::{self, ForUpdate, Record, StoreError};
use crate::types::{ContentKind, MediaKind, Source};

pub use http::HttpSource;
pub use source::{Cursor, RemoteItem, RemoteMedia, RemoteProfile, SourceClient, SourceError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync cancelled")]
    Cancelled,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("Failed to queue download: {0}")]
    Queue(#[from] PoolError),
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub page_size: usize,
    /// Keep paging even when a whole page brought no changes.
    pub force_rescan: bool,
    pub kinds: Vec<ContentKind>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: 10,
            force_rescan: false,
            kinds: ContentKind::ALL.to_vec(),
        }
    }
}

/// Counts for one content kind of one profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindReport {
    pub pages: usize,
    pub items: usize,
    pub changed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileReport {
    pub profile: Uuid,
    pub items: usize,
    pub changed: usize,
    /// Content kinds that ended with a hard error.
    pub failed_kinds: Vec<ContentKind>,
}

enum ItemOutcome {
    Changed,
    Unchanged,
    Skipped,
}

pub struct SyncDriver {
    db: Database,
    storage: Arc<dyn Storage>,
    queue: Arc<dyn DownloadQueue>,
    options: SyncOptions,
    cancel: CancellationToken,
}

impl SyncDriver {
    pub fn new(
        db: Database,
        storage: Arc<dyn Storage>,
        queue: Arc<dyn DownloadQueue>,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            storage,
            queue,
            options,
            cancel,
        }
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Refresh one profile and sync each enabled content kind.
    ///
    /// A hard error in one kind is logged and recorded in the report; the
    /// other kinds still run. Auth failures and cancellation end the profile.
    pub async fn sync_profile(
        &self,
        client: &dyn SourceClient,
        source_id: &str,
    ) -> Result<ProfileReport, SyncError> {
        self.check_cancelled()?;
        let profile = self.refresh_profile(client, source_id).await?;
        tracing::info!(profile = %source_id, username = %profile.username, "Syncing profile");

        let mut report = ProfileReport {
            profile: profile.id,
            ..ProfileReport::default()
        };
        for &kind in &self.options.kinds {
            match self.sync_kind(client, &profile, kind).await {
                Ok(kr) => {
                    tracing::info!(
                        profile = %source_id,
                        kind = %kind,
                        "{} items, {} changed, {} skipped over {} pages",
                        kr.items,
                        kr.changed,
                        kr.skipped,
                        kr.pages
                    );
                    report.items += kr.items;
                    report.changed += kr.changed;
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(SyncError::Source(e)) if e.is_auth() => return Err(SyncError::Source(e)),
                Err(e) => {
                    tracing::error!(profile = %source_id, kind = %kind, "Sync failed: {}", e);
                    report.failed_kinds.push(kind);
                }
            }
        }

        self.check_cancelled()?;
        Profile::mark_scraped(&self.db, profile.id, chrono::Utc::now().timestamp()).await?;
        Ok(report)
    }

    /// Upsert the profile row and stage avatar/header downloads that have
    /// not happened yet.
    async fn refresh_profile(
        &self,
        client: &dyn SourceClient,
        source_id: &str,
    ) -> Result<Profile, SyncError> {
        let remote = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            r = client.fetch_profile(source_id) => r?,
        };

        let mut fu: ForUpdate<Profile> =
            ForUpdate::find(&self.db, client.source(), source_id).await?;
        fu.set(|p| &mut p.username, remote.username);
        fu.set(|p| &mut p.name, remote.name.unwrap_or_default());
        let profile = (**fu).clone();
        fu.save().await?;

        let mut staged = Vec::new();
        for (slot, current, url) in [
            (ProfileImage::Avatar, &profile.avatar, remote.avatar),
            (ProfileImage::Header, &profile.header, remote.header),
        ] {
            let Some(url) = url.filter(|u| !u.is_empty()) else {
                continue;
            };
            if current.is_empty() {
                if let Some(op) = self.profile_image_op(client, profile.id, slot, &url) {
                    staged.push(op);
                }
            }
        }
        self.enqueue(staged).await?;
        Ok(profile)
    }

    /// Page through one content kind until the source runs out or a page
    /// brings nothing new.
    pub async fn sync_kind(
        &self,
        client: &dyn SourceClient,
        profile: &Profile,
        kind: ContentKind,
    ) -> Result<KindReport, SyncError> {
        let page_size = self.options.page_size.max(1);
        let mut cursor = Cursor::start(client.pagination());
        let mut report = KindReport::default();

        loop {
            self.check_cancelled()?;
            let listed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                r = client.list_items(kind, &profile.source_id, &cursor, page_size) => r,
            };
            let page = match listed {
                Ok(page) => page,
                Err(SourceError::NotFound(url)) => {
                    tracing::debug!(profile = %profile.source_id, kind = %kind, "Nothing at {}", url);
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            report.pages += 1;

            let mut changed = 0;
            for item in &page {
                self.check_cancelled()?;
                let outcome = match kind {
                    ContentKind::Posts => self.process_item::<Posts>(client, profile, item).await?,
                    ContentKind::Messages => {
                        self.process_item::<Messages>(client, profile, item).await?
                    }
                    ContentKind::Stories => {
                        self.process_item::<Stories>(client, profile, item).await?
                    }
                };
                match outcome {
                    ItemOutcome::Changed => changed += 1,
                    ItemOutcome::Unchanged => {}
                    ItemOutcome::Skipped => report.skipped += 1,
                }
            }
            report.items += page.len();
            report.changed += changed;

            if page.len() < page_size {
                break;
            }
            if changed == 0 && !self.options.force_rescan {
                tracing::debug!(
                    profile = %profile.source_id,
                    kind = %kind,
                    "No changes on page {}, stopping",
                    report.pages
                );
                break;
            }
            let next = cursor.advance(&page);
            if next == cursor {
                tracing::warn!(profile = %profile.source_id, kind = %kind, "Cursor did not advance, stopping");
                break;
            }
            cursor = next;
        }
        Ok(report)
    }

    /// Persist one remote item and its media. Downloads are queued once the
    /// item has committed.
    async fn process_item<K: ContentTable>(
        &self,
        client: &dyn SourceClient,
        profile: &Profile,
        item: &RemoteItem,
    ) -> Result<ItemOutcome, SyncError> {
        let source = client.source();
        let mut fu: ForUpdate<Content<K>> = ForUpdate::find(&self.db, source, &item.id).await?;

        let author = resolve_author(fu.tx(), source, profile, &item.author).await?;
        fu.set(|c| &mut c.author, author);
        fu.set(|c| &mut c.date, item.timestamp);
        fu.set(|c| &mut c.text, item.text.clone());

        if let Err(e) = store::Entity::validate(&**fu) {
            let kind = K::KIND;
            tracing::warn!(kind = %kind, item = %item.id, "Skipping invalid item: {}", e);
            fu.close().await?;
            return Ok(ItemOutcome::Skipped);
        }

        let mut staged = Vec::new();
        let mut media_ids = Vec::with_capacity(item.media.len());
        for remote in &item.media {
            if let Some(id) = self.sync_media(client, fu.tx(), item, remote, &mut staged).await? {
                media_ids.push(id);
            }
        }
        fu.set(|c| &mut c.media, MediaList::new(media_ids));

        let modified = fu.is_modified();
        fu.save().await?;

        let queued = !staged.is_empty();
        self.enqueue(staged).await?;

        Ok(if modified || queued {
            ItemOutcome::Changed
        } else {
            ItemOutcome::Unchanged
        })
    }

    /// Find or create the media row inside the item's transaction and stage
    /// downloads for renditions not stored yet.
    async fn sync_media(
        &self,
        client: &dyn SourceClient,
        tx: &mut dyn Executor,
        item: &RemoteItem,
        remote: &RemoteMedia,
        staged: &mut Vec<DownloadOp>,
    ) -> Result<Option<Uuid>, SyncError> {
        let kind = remote
            .kind
            .as_deref()
            .and_then(MediaKind::from_str)
            .or_else(|| paths::media_kind_from_url(&remote.url));
        let Some(kind) = kind else {
            tracing::warn!(item = %item.id, url = %paths::strip_query(&remote.url), "Skipping media of unknown type");
            return Ok(None);
        };
        let source_id = match remote.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => paths::strip_query(&remote.url).to_string(),
        };

        let mut media: Record<Media> = Record::find(tx, client.source(), &source_id).await?;
        media.set(|m| &mut m.kind, kind);
        media.set(|m| &mut m.visible, remote.visible);
        if let Err(e) = store::Entity::validate(&*media) {
            tracing::warn!(item = %item.id, "Skipping invalid media: {}", e);
            return Ok(None);
        }
        media.save(tx).await?;

        if remote.visible
            && media.slot_location(MediaSlot::Location).is_empty()
            && !remote.url.is_empty()
        {
            if let Some(op) = self.media_op(client, media.id, MediaSlot::Location, &remote.url) {
                staged.push(op);
            }
        }
        // A preview that is the full file itself is not fetched twice.
        let preview = remote.preview.as_deref().filter(|p| {
            !p.is_empty()
                && !(remote.visible
                    && !remote.url.is_empty()
                    && paths::strip_query(p) == paths::strip_query(&remote.url))
        });
        if let Some(preview) = preview {
            if media.slot_location(MediaSlot::Preview).is_empty() {
                if let Some(op) = self.media_op(client, media.id, MediaSlot::Preview, preview) {
                    staged.push(op);
                }
            }
        }
        Ok(Some(media.id))
    }

    fn media_op(
        &self,
        client: &dyn SourceClient,
        media_id: Uuid,
        slot: MediaSlot,
        url: &str,
    ) -> Option<DownloadOp> {
        let request = match client.media_request(url) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(media = %media_id, slot = slot.as_str(), "Skipping download: {}", e);
                return None;
            }
        };
        let destination = paths::store_filename(url);
        let db = self.db.clone();
        let storage = Arc::clone(&self.storage);
        let written = destination.clone();
        let url = url.to_string();
        Some(
            DownloadOp::new(destination, request).on_complete(move |hash| async move {
                dedup::record_media_download(
                    &db,
                    storage.as_ref(),
                    media_id,
                    slot,
                    &url,
                    &written,
                    &hash,
                )
                .await?;
                Ok(())
            }),
        )
    }

    fn profile_image_op(
        &self,
        client: &dyn SourceClient,
        profile_id: Uuid,
        slot: ProfileImage,
        url: &str,
    ) -> Option<DownloadOp> {
        let request = match client.media_request(url) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(profile = %profile_id, slot = slot.column(), "Skipping download: {}", e);
                return None;
            }
        };
        let destination = paths::store_filename(url);
        let db = self.db.clone();
        let written = destination.clone();
        Some(
            DownloadOp::new(destination, request).on_complete(move |_hash| async move {
                Profile::record_image(&db, profile_id, slot, &written).await?;
                Ok(())
            }),
        )
    }

    async fn enqueue(&self, staged: Vec<DownloadOp>) -> Result<(), SyncError> {
        for op in staged {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                r = self.queue.add(op) => r?,
            }
        }
        Ok(())
    }
}

/// Profile id for an item's author: the synced profile itself, any other
/// profile already stored, or nil (which fails validation).
async fn resolve_author(
    exec: &mut dyn Executor,
    source: Source,
    profile: &Profile,
    author: &str,
) -> Result<Uuid, DbError> {
    if author == profile.source_id {
        return Ok(profile.id);
    }
    Ok(store::find_by_source::<Profile>(exec, source, author)
        .await?
        .map_or(Uuid::nil(), |p| p.id))
}
