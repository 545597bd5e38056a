//! Minion UpgradeApp: image download, flash, and commit.
//!
//! PREPARE downloads the image over HTTP(S) in a worker task (the loop
//! never blocks), verifies the embedded MD5 and meta trailer, and flashes
//! the inactive partition. COMMIT schedules a reboot into the freshly
//! flashed partition. The current upgrade status is mirrored to StatusApp
//! on every change and persisted through [`UpgradeStateCache`] so a minion
//! restart resumes with the right state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::apps::{App, AppContext};
use crate::bus::Inbound;
use crate::messages::{
    appid, ImageMeta, Message, UpgradeReq, UpgradeReqType, UpgradeStatus, UpgradeStatusType,
};
use crate::minion::actions::SharedActionRunner;
use crate::nodecfg::CfgAction;
use crate::upgrade::verify_image_file;

/// Cache guarding upgrade state across minion restarts.
///
/// The file carries the serialized status, the software version it was
/// written under, and an MD5 over the status blob. A cache written by a
/// different image version (or corrupted) is discarded.
pub struct UpgradeStateCache {
    cache_file: PathBuf,
    active_version: String,
}

/// Upper bound on a sane cache file.
const MAX_CACHE_FILE_SIZE: u64 = 4096;

impl UpgradeStateCache {
    pub fn new(cache_file: impl Into<PathBuf>, active_version: impl Into<String>) -> Self {
        Self {
            cache_file: cache_file.into(),
            active_version: active_version.into(),
        }
    }

    /// Load the cached status, discarding anything suspect.
    pub fn load(&self) -> UpgradeStatus {
        let fallback = UpgradeStatus::default();
        let metadata = match std::fs::metadata(&self.cache_file) {
            Ok(m) => m,
            Err(_) => return fallback,
        };
        if metadata.len() == 0 || metadata.len() > MAX_CACHE_FILE_SIZE {
            warn!(
                "upgrade cache {} has bad size {}",
                self.cache_file.display(),
                metadata.len()
            );
            self.invalidate();
            return fallback;
        }
        let parsed: Option<serde_json::Value> = std::fs::read_to_string(&self.cache_file)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let Some(cache) = parsed else {
            self.invalidate();
            return fallback;
        };
        let (Some(status_str), Some(image), Some(md5)) = (
            cache.get("status").and_then(|v| v.as_str()),
            cache.get("image").and_then(|v| v.as_str()),
            cache.get("md5").and_then(|v| v.as_str()),
        ) else {
            warn!("upgrade cache {} incomplete", self.cache_file.display());
            self.invalidate();
            return fallback;
        };
        if hex::encode(md5::compute(status_str).0) != md5 {
            warn!("upgrade cache {} corrupt", self.cache_file.display());
            self.invalidate();
            return fallback;
        }
        if image != self.active_version {
            warn!(
                "upgrade cache {} written under {} (running {}), discarding",
                self.cache_file.display(),
                image,
                self.active_version
            );
            self.invalidate();
            return fallback;
        }
        match serde_json::from_str::<UpgradeStatus>(status_str) {
            Ok(status) => {
                info!(us_type = ?status.us_type, "restored upgrade status from cache");
                status
            }
            Err(_) => {
                self.invalidate();
                fallback
            }
        }
    }

    pub fn save(&self, status: &UpgradeStatus) {
        let Ok(status_str) = serde_json::to_string(status) else {
            return;
        };
        let cache = serde_json::json!({
            "status": status_str,
            "image": self.active_version,
            "md5": hex::encode(md5::compute(&status_str).0),
        });
        if let Some(parent) = self.cache_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) =
            std::fs::write(&self.cache_file, serde_json::to_string_pretty(&cache).unwrap_or_default())
        {
            warn!("failed to update upgrade cache: {}", e);
        }
    }

    pub fn invalidate(&self) {
        let _ = std::fs::remove_file(&self.cache_file);
    }
}

/// Flashing seam: production writes the inactive partition, tests record.
#[async_trait]
pub trait Flasher: Send + Sync {
    /// Write a verified image to the inactive partition.
    async fn flash(&self, image_path: &Path, meta: &ImageMeta) -> Result<()>;
    /// MD5 of the image currently on the inactive partition, if any.
    async fn flashed_md5(&self) -> Option<String>;
    /// Select the inactive partition for the next boot.
    async fn select_for_boot(&self) -> Result<()>;
}

/// Keeps the flashed image as a file next to the download dir. On real
/// hardware this would write the raw partition.
pub struct FileFlasher {
    target: PathBuf,
}

impl FileFlasher {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl Flasher for FileFlasher {
    async fn flash(&self, image_path: &Path, _meta: &ImageMeta) -> Result<()> {
        if let Some(parent) = self.target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(image_path, &self.target)
            .with_context(|| format!("flashing {}", self.target.display()))?;
        Ok(())
    }

    async fn flashed_md5(&self) -> Option<String> {
        let meta = verify_image_file(&self.target).ok()?;
        Some(meta.md5)
    }

    async fn select_for_boot(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MinionUpgradeAppConfig {
    pub download_dir: PathBuf,
    pub use_https: bool,
}

pub struct UpgradeApp {
    cfg: MinionUpgradeAppConfig,
    cache: UpgradeStateCache,
    flasher: Arc<dyn Flasher>,
    runner: SharedActionRunner,
    status: UpgradeStatus,
    /// The request being prepared (set while a download is in flight).
    active_req: Option<UpgradeReq>,
}

impl UpgradeApp {
    pub fn new(
        cfg: MinionUpgradeAppConfig,
        cache: UpgradeStateCache,
        flasher: Arc<dyn Flasher>,
        runner: SharedActionRunner,
    ) -> Self {
        let status = cache.load();
        Self {
            cfg,
            cache,
            flasher,
            runner,
            status,
            active_req: None,
        }
    }

    pub fn current_status(&self) -> &UpgradeStatus {
        &self.status
    }

    async fn set_status(&mut self, ctx: &AppContext, status: UpgradeStatus) {
        self.status = status;
        self.cache.save(&self.status);
        ctx.bus
            .send(
                "",
                appid::MINION_STATUS,
                appid::MINION_UPGRADE,
                Message::SetUpgradeStatus(self.status.clone()),
            )
            .await;
    }

    async fn start_prepare(&mut self, ctx: &AppContext, req: UpgradeReq) {
        // Idempotence: the flashed partition already carries this image.
        if let Some(flashed) = self.flasher.flashed_md5().await {
            if flashed == req.md5 {
                info!(md5 = %req.md5, "image already flashed, reporting success");
                let meta = ImageMeta {
                    md5: req.md5.clone(),
                    ..self.status.next_image.clone()
                };
                self.set_status(
                    ctx,
                    UpgradeStatus {
                        us_type: UpgradeStatusType::Flashed,
                        next_image: meta,
                        reason: String::new(),
                        upgrade_req_id: req.upgrade_req_id,
                        when_to_commit: 0,
                    },
                )
                .await;
                return;
            }
        }

        if req.image_url.starts_with("magnet:") {
            // Torrent distribution is not carried by this build.
            self.set_status(
                ctx,
                UpgradeStatus {
                    us_type: UpgradeStatusType::DownloadFailed,
                    next_image: ImageMeta::default(),
                    reason: "magnet URIs are not supported".into(),
                    upgrade_req_id: req.upgrade_req_id,
                    when_to_commit: 0,
                },
            )
            .await;
            return;
        }
        if self.cfg.use_https && !req.image_url.starts_with("https://") {
            self.set_status(
                ctx,
                UpgradeStatus {
                    us_type: UpgradeStatusType::DownloadFailed,
                    next_image: ImageMeta::default(),
                    reason: "only HTTPS image downloads are allowed".into(),
                    upgrade_req_id: req.upgrade_req_id,
                    when_to_commit: 0,
                },
            )
            .await;
            return;
        }

        info!(url = %req.image_url, "starting image download");
        self.set_status(
            ctx,
            UpgradeStatus {
                us_type: UpgradeStatusType::DownloadingImage,
                next_image: ImageMeta::default(),
                reason: String::new(),
                upgrade_req_id: req.upgrade_req_id.clone(),
                when_to_commit: 0,
            },
        )
        .await;

        let url = req.image_url.clone();
        let dir = self.cfg.download_dir.clone();
        let timeout = Duration::from_secs(req.download_timeout_s.max(30));
        let bus = ctx.bus.clone();
        self.active_req = Some(req);
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, download_image(&url, &dir)).await;
            let message = match result {
                Ok(Ok(path)) => Message::UpgradeDownloadDone {
                    success: true,
                    local_path: path.to_string_lossy().into_owned(),
                    reason: String::new(),
                },
                Ok(Err(e)) => Message::UpgradeDownloadDone {
                    success: false,
                    local_path: String::new(),
                    reason: e.to_string(),
                },
                Err(_) => Message::UpgradeDownloadDone {
                    success: false,
                    local_path: String::new(),
                    reason: "download timed out".into(),
                },
            };
            bus.send("", appid::MINION_UPGRADE, appid::MINION_UPGRADE, message)
                .await;
        });
    }

    /// Verify and flash a downloaded image.
    async fn process_download_done(
        &mut self,
        ctx: &AppContext,
        success: bool,
        local_path: &str,
        reason: &str,
    ) {
        let Some(req) = self.active_req.take() else {
            debug!("download completion without an active request, dropping");
            return;
        };
        if !success {
            warn!(reason, "image download failed");
            self.set_status(
                ctx,
                UpgradeStatus {
                    us_type: UpgradeStatusType::DownloadFailed,
                    next_image: ImageMeta::default(),
                    reason: reason.to_string(),
                    upgrade_req_id: req.upgrade_req_id,
                    when_to_commit: 0,
                },
            )
            .await;
            return;
        }

        let path = PathBuf::from(local_path);
        let meta = match verify_image_file(&path) {
            Ok(meta) if meta.md5 == req.md5 || req.md5.is_empty() => meta,
            Ok(meta) => {
                self.set_status(
                    ctx,
                    UpgradeStatus {
                        us_type: UpgradeStatusType::DownloadFailed,
                        next_image: ImageMeta::default(),
                        reason: format!(
                            "image MD5 {} does not match requested {}",
                            meta.md5, req.md5
                        ),
                        upgrade_req_id: req.upgrade_req_id,
                        when_to_commit: 0,
                    },
                )
                .await;
                return;
            }
            Err(e) => {
                self.set_status(
                    ctx,
                    UpgradeStatus {
                        us_type: UpgradeStatusType::DownloadFailed,
                        next_image: ImageMeta::default(),
                        reason: e.to_string(),
                        upgrade_req_id: req.upgrade_req_id,
                        when_to_commit: 0,
                    },
                )
                .await;
                return;
            }
        };

        info!(version = %meta.version, "image verified, flashing");
        self.set_status(
            ctx,
            UpgradeStatus {
                us_type: UpgradeStatusType::FlashingImage,
                next_image: meta.clone(),
                reason: String::new(),
                upgrade_req_id: req.upgrade_req_id.clone(),
                when_to_commit: 0,
            },
        )
        .await;

        match self.flasher.flash(&path, &meta).await {
            Ok(()) => {
                info!(version = %meta.version, "image flashed");
                self.set_status(
                    ctx,
                    UpgradeStatus {
                        us_type: UpgradeStatusType::Flashed,
                        next_image: meta,
                        reason: String::new(),
                        upgrade_req_id: req.upgrade_req_id,
                        when_to_commit: 0,
                    },
                )
                .await;
            }
            Err(e) => {
                warn!("flash failed: {}", e);
                self.set_status(
                    ctx,
                    UpgradeStatus {
                        us_type: UpgradeStatusType::FlashFailed,
                        next_image: meta,
                        reason: e.to_string(),
                        upgrade_req_id: req.upgrade_req_id,
                        when_to_commit: 0,
                    },
                )
                .await;
            }
        }
        let _ = std::fs::remove_file(&path);
    }

    async fn schedule_commit(&mut self, ctx: &AppContext, req: UpgradeReq) {
        if self.status.us_type != UpgradeStatusType::Flashed {
            warn!(us_type = ?self.status.us_type, "commit requested without a flashed image");
            let mut status = self.status.clone();
            status.reason = "commit requested without a flashed image".into();
            self.set_status(ctx, status).await;
            return;
        }
        let delay = Duration::from_secs(req.schedule_to_commit);
        info!(delay_s = req.schedule_to_commit, "commit scheduled");
        let mut status = self.status.clone();
        status.us_type = UpgradeStatusType::CommitPending;
        status.upgrade_req_id = req.upgrade_req_id;
        status.when_to_commit = chrono::Utc::now().timestamp() + req.schedule_to_commit as i64;
        self.set_status(ctx, status).await;

        // The boot-partition switch and reboot run after the status ack has
        // had a chance to egress.
        let flasher = self.flasher.clone();
        let runner = self.runner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay.max(Duration::from_secs(2))).await;
            match flasher.select_for_boot().await {
                Ok(()) => {
                    info!("rebooting into the new image");
                    runner.run(CfgAction::Reboot).await;
                }
                Err(e) => warn!("boot partition switch failed: {}", e),
            }
        });
    }

    async fn process_message(&mut self, ctx: &AppContext, inbound: Inbound) {
        match inbound.message {
            Message::UpgradeReq(req) => match req.ur_type {
                UpgradeReqType::PrepareUpgrade => self.start_prepare(ctx, req).await,
                UpgradeReqType::CommitUpgrade => self.schedule_commit(ctx, req).await,
                UpgradeReqType::ResetStatus => {
                    info!("resetting upgrade status");
                    self.active_req = None;
                    self.cache.invalidate();
                    self.set_status(ctx, UpgradeStatus::default()).await;
                }
                UpgradeReqType::FullUpgrade => {
                    // The controller always splits FULL into prepare+commit.
                    warn!("unexpected FULL_UPGRADE at the minion, ignoring");
                }
            },
            Message::UpgradeDownloadDone {
                success,
                local_path,
                reason,
            } => {
                self.process_download_done(ctx, success, &local_path, &reason)
                    .await;
            }
            other => {
                debug!(kind = other.kind(), from = %inbound.sender_app, "unexpected message");
            }
        }
    }
}

/// Fetch an image to the download directory.
async fn download_image(url: &str, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let parsed = url::Url::parse(url).context("parsing image url")?;
    let name = parsed
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("image.bin")
        .to_string();
    let dest = dir.join(&name);
    let tmp = dir.join(format!("{}.tmp", name));

    let client = reqwest::Client::builder()
        .build()
        .context("building http client")?;
    let resp = client.get(url).send().await.context("fetching image")?;
    if !resp.status().is_success() {
        anyhow::bail!("image fetch failed: {}", resp.status());
    }
    let bytes = resp.bytes().await.context("reading image body")?;
    std::fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &dest).context("renaming downloaded image")?;
    Ok(dest)
}

#[async_trait]
impl App for UpgradeApp {
    fn app_id(&self) -> &'static str {
        appid::MINION_UPGRADE
    }

    async fn run(&mut self, mut ctx: AppContext) -> Result<()> {
        // Surface any cached status immediately (e.g. FLASHED before a
        // commit-triggered reboot).
        let status = self.status.clone();
        self.set_status(&ctx, status).await;

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                inbound = ctx.inbox.recv() => {
                    let Some(inbound) = inbound else { break };
                    self.process_message(&ctx, inbound).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingFlasher {
        flashed: Mutex<Option<ImageMeta>>,
        committed: Mutex<bool>,
    }

    impl RecordingFlasher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                flashed: Mutex::new(None),
                committed: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl Flasher for RecordingFlasher {
        async fn flash(&self, _image_path: &Path, meta: &ImageMeta) -> Result<()> {
            *self.flashed.lock().unwrap() = Some(meta.clone());
            Ok(())
        }

        async fn flashed_md5(&self) -> Option<String> {
            self.flashed.lock().unwrap().as_ref().map(|m| m.md5.clone())
        }

        async fn select_for_boot(&self) -> Result<()> {
            *self.committed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn test_app(tmp: &TempDir) -> (UpgradeApp, Arc<RecordingFlasher>) {
        let flasher = RecordingFlasher::new();
        let app = UpgradeApp::new(
            MinionUpgradeAppConfig {
                download_dir: tmp.path().join("dl"),
                use_https: false,
            },
            UpgradeStateCache::new(tmp.path().join("upgradeCache.json"), "RELEASE_M80"),
            flasher.clone(),
            Arc::new(crate::minion::actions::testing::RecordingRunner::default()),
        );
        (app, flasher)
    }

    fn ctx() -> crate::apps::AppContext {
        let (bus, _rx) = crate::bus::outbound_channel();
        let (_tx, inbox) = tokio::sync::mpsc::channel(32);
        crate::apps::AppContext {
            bus,
            inbox,
            events: crate::events::EventClient::new(
                appid::MINION_UPGRADE,
                crate::events::create_event_bus(),
            ),
            shutdown: tokio_util::sync::CancellationToken::new(),
        }
    }

    fn req(ur_type: UpgradeReqType, md5: &str, url: &str) -> UpgradeReq {
        UpgradeReq {
            ur_type,
            upgrade_req_id: "req-1".into(),
            md5: md5.into(),
            image_url: url.into(),
            schedule_to_commit: 0,
            download_timeout_s: 60,
        }
    }

    #[tokio::test]
    async fn test_magnet_uri_rejected() {
        let tmp = TempDir::new().unwrap();
        let (mut app, _) = test_app(&tmp);
        let ctx = ctx();
        app.start_prepare(&ctx, req(UpgradeReqType::PrepareUpgrade, "x", "magnet:?xt=urn"))
            .await;
        assert_eq!(app.current_status().us_type, UpgradeStatusType::DownloadFailed);
        assert!(app.current_status().reason.contains("magnet"));
    }

    #[tokio::test]
    async fn test_https_enforcement() {
        let tmp = TempDir::new().unwrap();
        let (mut app, _) = test_app(&tmp);
        app.cfg.use_https = true;
        let ctx = ctx();
        app.start_prepare(
            &ctx,
            req(UpgradeReqType::PrepareUpgrade, "x", "http://ctrl/images/img.bin"),
        )
        .await;
        assert_eq!(app.current_status().us_type, UpgradeStatusType::DownloadFailed);
    }

    #[tokio::test]
    async fn test_verified_download_flashes() {
        let tmp = TempDir::new().unwrap();
        let (mut app, flasher) = test_app(&tmp);
        let ctx = ctx();

        let image = crate::upgrade::build_image(b"payload", "RELEASE_M81", "PUMA", &[]);
        let meta = crate::upgrade::verify_image(&image).unwrap();
        let local = tmp.path().join("img.bin");
        std::fs::write(&local, &image).unwrap();

        app.active_req = Some(req(
            UpgradeReqType::PrepareUpgrade,
            &meta.md5,
            "http://ctrl/images/img.bin",
        ));
        app.process_download_done(&ctx, true, local.to_str().unwrap(), "")
            .await;

        assert_eq!(app.current_status().us_type, UpgradeStatusType::Flashed);
        assert_eq!(app.current_status().next_image.version, "RELEASE_M81");
        assert_eq!(
            flasher.flashed.lock().unwrap().as_ref().unwrap().md5,
            meta.md5
        );
    }

    #[tokio::test]
    async fn test_md5_mismatch_fails_download() {
        let tmp = TempDir::new().unwrap();
        let (mut app, _) = test_app(&tmp);
        let ctx = ctx();

        let image = crate::upgrade::build_image(b"payload", "RELEASE_M81", "PUMA", &[]);
        let local = tmp.path().join("img.bin");
        std::fs::write(&local, &image).unwrap();

        app.active_req = Some(req(
            UpgradeReqType::PrepareUpgrade,
            "0123456789abcdef0123456789abcdef",
            "http://ctrl/images/img.bin",
        ));
        app.process_download_done(&ctx, true, local.to_str().unwrap(), "")
            .await;
        assert_eq!(app.current_status().us_type, UpgradeStatusType::DownloadFailed);
    }

    #[tokio::test]
    async fn test_duplicate_prepare_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (mut app, flasher) = test_app(&tmp);
        let ctx = ctx();
        *flasher.flashed.lock().unwrap() = Some(ImageMeta {
            md5: "abc".into(),
            version: "RELEASE_M81".into(),
            model: String::new(),
            hardware_board_ids: vec![],
        });
        app.start_prepare(
            &ctx,
            req(UpgradeReqType::PrepareUpgrade, "abc", "http://ctrl/images/img.bin"),
        )
        .await;
        // No re-download: the status goes straight to FLASHED.
        assert_eq!(app.current_status().us_type, UpgradeStatusType::Flashed);
        assert!(app.active_req.is_none());
    }

    #[tokio::test]
    async fn test_commit_without_flash_refused() {
        let tmp = TempDir::new().unwrap();
        let (mut app, flasher) = test_app(&tmp);
        let ctx = ctx();
        app.schedule_commit(&ctx, req(UpgradeReqType::CommitUpgrade, "", ""))
            .await;
        assert!(!*flasher.committed.lock().unwrap());
        assert!(app.current_status().reason.contains("without a flashed image"));
    }

    #[tokio::test]
    async fn test_state_cache_round_trip() {
        let tmp = TempDir::new().unwrap();
        let cache = UpgradeStateCache::new(tmp.path().join("cache.json"), "RELEASE_M80");
        let status = UpgradeStatus {
            us_type: UpgradeStatusType::Flashed,
            next_image: ImageMeta {
                md5: "abc".into(),
                version: "RELEASE_M81".into(),
                model: String::new(),
                hardware_board_ids: vec![],
            },
            reason: String::new(),
            upgrade_req_id: "req-1".into(),
            when_to_commit: 0,
        };
        cache.save(&status);
        assert_eq!(cache.load(), status);

        // A cache written under a different running version is discarded.
        let other = UpgradeStateCache::new(tmp.path().join("cache.json"), "RELEASE_M81");
        assert_eq!(other.load(), UpgradeStatus::default());
    }

    #[tokio::test]
    async fn test_corrupt_cache_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        std::fs::write(&path, r#"{"status": "{}", "image": "RELEASE_M80", "md5": "nope"}"#)
            .unwrap();
        let cache = UpgradeStateCache::new(&path, "RELEASE_M80");
        assert_eq!(cache.load(), UpgradeStatus::default());
        assert!(!path.exists());
    }
}
