use std::sync::Arc;

use fsb_core::{
    config::Config,
    domain::ChatId,
    expiry::{DeliveryWorkflow, WorkflowConfig},
    index::IndexEngine,
    link::{LinkCodec, LinkResolver, SigningKeys},
    records::{JsonRecordStore, RecordStore},
    store::{ContentStore, RetryPolicy},
    workspace::{WorkspaceManager, WorkspaceOptions},
};
use fsb_media::{FfmpegConfig, FfmpegProcessor};
use fsb_telegram::{
    router::{self, AppState},
    Bot, TelegramVault,
};

#[tokio::main]
async fn main() -> Result<(), fsb_core::Error> {
    fsb_core::logging::init("fsb");

    let cfg = Arc::new(Config::load()?);

    let bot = Bot::new(cfg.bot_token.clone());
    let vault = Arc::new(TelegramVault::new(
        bot.clone(),
        cfg.store_channel,
        ChatId(cfg.owner_id),
    ));
    let store = Arc::new(ContentStore::new(vault, RetryPolicy::from_config(&cfg)));

    let records: Arc<dyn RecordStore> = Arc::new(JsonRecordStore::open(&cfg.records_file)?);

    let index = Arc::new(IndexEngine::new());
    index.restore(records.load_index_snapshot().await?);

    let workflow = Arc::new(DeliveryWorkflow::new(WorkflowConfig::from_config(&cfg)));
    workflow.restore(records.load_artifacts().await?);

    let codec = LinkCodec::new(SigningKeys::from_config(
        &cfg.link_signing_key,
        &cfg.link_previous_keys,
    ));
    let resolver = Arc::new(LinkResolver::new(codec, store.clone()));

    let processor = Arc::new(FfmpegProcessor::new(FfmpegConfig::from_config(&cfg)));
    let workspaces = Arc::new(WorkspaceManager::new(
        WorkspaceOptions::from_config(&cfg),
        store.clone(),
        processor,
    ));

    let state = Arc::new(AppState::new(
        cfg, store, index, workflow, workspaces, resolver, records,
    ));

    router::run_polling(bot, state)
        .await
        .map_err(|e| fsb_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
