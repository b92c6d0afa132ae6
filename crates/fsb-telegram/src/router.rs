use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use teloxide::{
    dispatching::Dispatcher,
    dptree,
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fsb_core::{
    config::Config,
    domain::Reference,
    expiry::DeliveryWorkflow,
    formatting::readable_duration,
    index::{IndexEngine, ReindexCursor},
    link::LinkResolver,
    records::RecordStore,
    store::ContentStore,
    workspace::{spawn_reaper, WorkspaceManager},
};

use crate::handlers;

/// Multi-step conversation state, keyed by user id.
#[derive(Clone, Debug)]
pub enum Pending {
    /// `/genlink`: waiting for a forwarded store-channel file.
    GenlinkSource,
    /// `/batch`: waiting for the first file of the range.
    BatchFirst,
    /// `/batch`: waiting for the last file of the range.
    BatchSecond { first: Reference },
    /// `/process`: waiting for the source video.
    ProcessSource,
    /// Workspace: waiting for `<start> <duration>` clip details.
    ClipDetails,
    /// Workspace: waiting for a screenshot timestamp in seconds.
    ScreenshotAt,
    /// Workspace: waiting for watermark text.
    WatermarkText,
    /// Admin is composing a reply to a content request.
    AdminReply { target: i64 },
}

/// Tallies for an active bulk re-index session.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReindexStats {
    pub new: usize,
    pub duplicate: usize,
    pub cursor: ReindexCursor,
}

pub struct AppState {
    pub cfg: Arc<Config>,
    pub store: Arc<ContentStore>,
    pub index: Arc<IndexEngine>,
    pub workflow: Arc<DeliveryWorkflow>,
    pub workspaces: Arc<WorkspaceManager>,
    pub resolver: Arc<LinkResolver>,
    pub records: Arc<dyn RecordStore>,
    pub pending: DashMap<i64, Pending>,
    pub indexing: DashMap<i64, ReindexStats>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<ContentStore>,
        index: Arc<IndexEngine>,
        workflow: Arc<DeliveryWorkflow>,
        workspaces: Arc<WorkspaceManager>,
        resolver: Arc<LinkResolver>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            cfg,
            store,
            index,
            workflow,
            workspaces,
            resolver,
            records,
            pending: DashMap::new(),
            indexing: DashMap::new(),
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.cfg.is_admin(user_id)
    }
}

pub async fn run_polling(bot: Bot, state: Arc<AppState>) -> anyhow::Result<()> {
    if let Ok(me) = bot.get_me().await {
        info!("fsb started: @{}", me.username());
    }
    info!(
        store_channel = state.cfg.store_channel.0,
        admins = state.cfg.admins.len(),
        "configuration loaded"
    );

    let cancel = CancellationToken::new();

    // Expired deliveries get their countdown notice swapped for the
    // re-request affordance on a bounded cadence; no per-artifact timers.
    let sweep = {
        let bot = bot.clone();
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { expiry_sweep_loop(bot, state, cancel).await })
    };

    let reaper = spawn_reaper(
        state.workspaces.clone(),
        Duration::from_secs(60),
        cancel.clone(),
    );

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_channel_post().endpoint(handlers::handle_channel_post))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    cancel.cancel();
    let _ = sweep.await;
    let _ = reaper.await;
    Ok(())
}

async fn expiry_sweep_loop(bot: Bot, state: Arc<AppState>, cancel: CancellationToken) {
    let interval = state.cfg.expiry_sweep_interval;
    if interval.is_zero() || state.cfg.delivery_ttl.is_zero() {
        info!("expiry sweep disabled");
        return;
    }

    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = tick.tick() => {
            if let Err(e) = sweep_once(&bot, &state).await {
                error!("expiry sweep failed: {e}");
            }
          }
        }
    }
}

async fn sweep_once(bot: &Bot, state: &Arc<AppState>) -> anyhow::Result<()> {
    let expired = state.workflow.take_newly_expired(chrono::Utc::now());
    for artifact in &expired {
        // Remove the delivered copy.
        let chat = teloxide::types::ChatId(artifact.delivery.chat_id.0);
        if let Err(e) = bot
            .delete_message(chat, teloxide::types::MessageId(artifact.delivery.message_id.0))
            .await
        {
            warn!(artifact = artifact.id, "could not delete expired copy: {e}");
        }

        let Some(notice) = artifact.notice else {
            continue;
        };
        let notice_id = teloxide::types::MessageId(notice.message_id.0);

        if artifact.redelivery {
            let _ = bot
                .edit_message_text(chat, notice_id, "🚫 <b>This re-requested file has expired.</b>")
                .parse_mode(ParseMode::Html)
                .await;
            continue;
        }

        let hours = state.cfg.rerequest_window.as_secs() / 3600;
        let keyboard = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
            "🔄 Request File Again",
            format!("rerequest_{}", artifact.id),
        )]]);
        let text = format!(
            "⏳ <b>This file has expired.</b>\n\nYou can request it again within the next {hours} hours."
        );
        if let Err(e) = bot
            .edit_message_text(chat, notice_id, text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await
        {
            warn!(artifact = artifact.id, "could not edit expiry notice: {e}");
        }
    }

    // Piggyback persistence on the sweep cadence.
    state
        .records
        .save_index_snapshot(state.index.snapshot())
        .await?;
    state
        .records
        .save_artifacts(state.workflow.snapshot())
        .await?;

    if !expired.is_empty() {
        info!(count = expired.len(), "expired deliveries swept");
    }
    Ok(())
}

/// Countdown text under a fresh delivery.
pub fn delivery_notice_text(ttl: Duration) -> String {
    format!(
        "⏳ This file will expire in <b>{}</b>.",
        readable_duration(ttl.as_secs())
    )
}
