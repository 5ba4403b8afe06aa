//! # 渠道注册表
//!
//! 读多写少的渠道缓存：启动时整体加载，按周期 `refresh_all` 重建，
//! 单个渠道可 `invalidate` 后按需回源读取。状态变更立即生效。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use entity::channels;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use tokio::sync::RwLock;

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{lerror, linfo, lwarn};

use super::types::{Channel, ChannelStatus};

/// 渠道数据来源
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// 读取所有未删除的渠道
    async fn load_all(&self) -> Result<Vec<Channel>>;

    /// 读取单个渠道，不存在或已删除返回 `None`
    async fn load(&self, channel_id: i32) -> Result<Option<Channel>>;

    /// 持久化渠道状态
    async fn set_status(&self, channel_id: i32, status: ChannelStatus) -> Result<()>;
}

/// 基于数据库的渠道来源
pub struct DbChannelSource {
    db: Arc<DatabaseConnection>,
}

impl DbChannelSource {
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ChannelSource for DbChannelSource {
    async fn load_all(&self) -> Result<Vec<Channel>> {
        let rows = channels::Entity::find()
            .filter(channels::Column::Deleted.eq(false))
            .all(self.db.as_ref())
            .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let channel_id = row.id;
            match Channel::try_from(row) {
                Ok(channel) => result.push(channel),
                Err(e) => {
                    lwarn!(
                        "system",
                        LogStage::Cache,
                        LogComponent::ChannelRegistry,
                        "skip_channel",
                        &format!("跳过无法解析的渠道: {e}"),
                        channel_id = channel_id
                    );
                }
            }
        }
        Ok(result)
    }

    async fn load(&self, channel_id: i32) -> Result<Option<Channel>> {
        let row = channels::Entity::find_by_id(channel_id)
            .filter(channels::Column::Deleted.eq(false))
            .one(self.db.as_ref())
            .await?;
        row.map(Channel::try_from).transpose()
    }

    async fn set_status(&self, channel_id: i32, status: ChannelStatus) -> Result<()> {
        let row = channels::Entity::find_by_id(channel_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ProxyError::database(format!("渠道不存在: {channel_id}")))?;
        let mut active: channels::ActiveModel = row.into();
        active.status = Set(status.code());
        active.update(self.db.as_ref()).await?;
        Ok(())
    }
}

/// 内存渠道来源（单机部署或测试使用）
#[derive(Default)]
pub struct MemoryChannelSource {
    channels: RwLock<HashMap<i32, Channel>>,
}

impl MemoryChannelSource {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels: RwLock::new(channels.into_iter().map(|c| (c.id, c)).collect()),
        }
    }

    pub async fn upsert(&self, channel: Channel) {
        self.channels.write().await.insert(channel.id, channel);
    }

    pub async fn remove(&self, channel_id: i32) {
        self.channels.write().await.remove(&channel_id);
    }
}

#[async_trait]
impl ChannelSource for MemoryChannelSource {
    async fn load_all(&self) -> Result<Vec<Channel>> {
        Ok(self.channels.read().await.values().cloned().collect())
    }

    async fn load(&self, channel_id: i32) -> Result<Option<Channel>> {
        Ok(self.channels.read().await.get(&channel_id).cloned())
    }

    async fn set_status(&self, channel_id: i32, status: ChannelStatus) -> Result<()> {
        if let Some(channel) = self.channels.write().await.get_mut(&channel_id) {
            channel.status = status;
        }
        Ok(())
    }
}

/// 候选渠道查询结果
#[derive(Debug, Default)]
pub struct Candidates {
    pub channels: Vec<Arc<Channel>>,
    /// 索引命中但记录已不存在的渠道
    pub missing: Vec<i32>,
}

#[derive(Default)]
struct Snapshot {
    channels: HashMap<i32, Arc<Channel>>,
    /// 分组 -> 渠道 id
    group_index: HashMap<String, Vec<i32>>,
}

impl Snapshot {
    fn build(channels: Vec<Channel>) -> Self {
        let mut snapshot = Self::default();
        for channel in channels {
            for group in &channel.groups {
                snapshot
                    .group_index
                    .entry(group.clone())
                    .or_default()
                    .push(channel.id);
            }
            snapshot.channels.insert(channel.id, Arc::new(channel));
        }
        snapshot
    }
}

/// 渠道注册表
pub struct ChannelRegistry {
    source: Arc<dyn ChannelSource>,
    snapshot: RwLock<Snapshot>,
}

impl ChannelRegistry {
    pub fn new(source: Arc<dyn ChannelSource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// 创建并完成首次加载
    pub async fn load(source: Arc<dyn ChannelSource>) -> Result<Self> {
        let registry = Self::new(source);
        registry.refresh_all().await?;
        Ok(registry)
    }

    /// 重新加载全部渠道并重建索引
    pub async fn refresh_all(&self) -> Result<()> {
        let channels = self.source.load_all().await?;
        let count = channels.len();
        let snapshot = Snapshot::build(channels);
        *self.snapshot.write().await = snapshot;

        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::ChannelRegistry,
            "refresh_all",
            "Channel registry refreshed",
            channel_count = count
        );
        Ok(())
    }

    /// 读取渠道，缓存未命中时回源
    pub async fn get(&self, channel_id: i32) -> Result<Option<Arc<Channel>>> {
        if let Some(channel) = self.snapshot.read().await.channels.get(&channel_id) {
            return Ok(Some(Arc::clone(channel)));
        }

        let Some(channel) = self.source.load(channel_id).await? else {
            return Ok(None);
        };
        let channel = Arc::new(channel);
        self.snapshot
            .write()
            .await
            .channels
            .insert(channel_id, Arc::clone(&channel));
        Ok(Some(channel))
    }

    /// 使单个渠道的缓存失效，下一次读取时回源
    pub async fn invalidate(&self, channel_id: i32) {
        self.snapshot.write().await.channels.remove(&channel_id);
    }

    /// 修改渠道状态：先持久化，再更新缓存
    pub async fn set_status(&self, channel_id: i32, status: ChannelStatus) -> Result<()> {
        self.source.set_status(channel_id, status).await?;

        let mut snapshot = self.snapshot.write().await;
        if let Some(current) = snapshot.channels.get(&channel_id) {
            let mut updated = Channel::clone(current);
            updated.status = status;
            snapshot.channels.insert(channel_id, Arc::new(updated));
        }
        Ok(())
    }

    /// 按分组列出候选渠道（不做状态与模型过滤）
    pub async fn candidates(&self, group: &str) -> Result<Candidates> {
        let (mut found, unresolved) = {
            let snapshot = self.snapshot.read().await;
            let ids = snapshot.group_index.get(group).cloned().unwrap_or_default();
            let mut found = Vec::with_capacity(ids.len());
            let mut unresolved = Vec::new();
            for id in ids {
                match snapshot.channels.get(&id) {
                    Some(channel) => found.push(Arc::clone(channel)),
                    None => unresolved.push(id),
                }
            }
            (found, unresolved)
        };

        let mut missing = Vec::new();
        for id in unresolved {
            match self.get(id).await? {
                Some(channel) => found.push(channel),
                None => {
                    lerror!(
                        "system",
                        LogStage::Scheduling,
                        LogComponent::ChannelRegistry,
                        "index_inconsistent",
                        "Indexed channel no longer exists",
                        channel_id = id,
                        group = group
                    );
                    missing.push(id);
                }
            }
        }

        Ok(Candidates {
            channels: found,
            missing,
        })
    }

    /// 启动后台周期刷新任务
    pub fn spawn_refresh_task(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = registry.refresh_all().await {
                    lwarn!(
                        "system",
                        LogStage::BackgroundTask,
                        LogComponent::ChannelRegistry,
                        "refresh_failed",
                        &format!("渠道缓存刷新失败: {e}")
                    );
                }
            }
        })
    }
}
