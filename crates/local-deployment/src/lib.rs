use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use services::services::{
    approvals::ApprovalBroker,
    config::{Config, load_config_from_file, save_config_to_file},
    container::ContainerService,
    events::EventService,
    git::GitService,
};
use tokio::sync::RwLock;
use utils::{assets, msg_store::MsgStore};
use uuid::Uuid;

use crate::container::LocalContainerService;

mod command;
pub mod container;

#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<RwLock<Config>>,
    db: DBService,
    msg_stores: Arc<RwLock<HashMap<Uuid, Arc<MsgStore>>>>,
    container: LocalContainerService,
    git: GitService,
    events: EventService,
    approvals: ApprovalBroker,
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        let mut raw_config = load_config_from_file(&assets::config_path()).await;

        {
            let current_version = utils::APP_VERSION;
            if raw_config.last_app_version.as_deref() != Some(current_version) {
                raw_config.last_app_version = Some(current_version.to_string());
            }
        }
        save_config_to_file(&raw_config, &assets::config_path()).await?;

        let auto_commit = raw_config.auto_commit;
        let config = Arc::new(RwLock::new(raw_config));
        let git = GitService::new();
        let msg_stores = Arc::new(RwLock::new(HashMap::new()));

        // Row-change events flow through one shared store fed by the
        // sqlite update hook.
        let events_msg_store = Arc::new(MsgStore::new());
        let events_entry_count = Arc::new(RwLock::new(0));

        let db = {
            let hook = EventService::create_hook(
                events_msg_store.clone(),
                DBService::new(&assets::db_path()).await?,
            );
            DBService::new_with_after_connect(&assets::db_path(), hook).await?
        };

        let container = LocalContainerService::new(
            db.clone(),
            msg_stores.clone(),
            config.clone(),
            git.clone(),
            auto_commit,
        );

        let events = EventService::new(db.clone(), events_msg_store, events_entry_count);
        let approvals = ApprovalBroker::new(db.clone());

        Ok(Self {
            config,
            db,
            msg_stores,
            container,
            git,
            events,
            approvals,
        })
    }

    fn config(&self) -> &Arc<RwLock<Config>> {
        &self.config
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn container(&self) -> &impl ContainerService {
        &self.container
    }

    fn git(&self) -> &GitService {
        &self.git
    }

    fn events(&self) -> &EventService {
        &self.events
    }

    fn approvals(&self) -> &ApprovalBroker {
        &self.approvals
    }
}

impl LocalDeployment {
    pub fn msg_stores(&self) -> &Arc<RwLock<HashMap<Uuid, Arc<MsgStore>>>> {
        &self.msg_stores
    }

    pub async fn shutdown(&self) {
        self.container.kill_all_running().await;
    }
}
