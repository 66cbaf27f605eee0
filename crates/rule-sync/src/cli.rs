//! 运维命令行
//!
//! 使用 clap derive 定义子命令，每个子命令对应同步服务的一项操作。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use adx_shared::config::AppConfig;
use adx_shared::database::Database;

use crate::compiler;
use crate::dto::RuleInput;
use crate::family::RuleFamily;
use crate::models::{DimensionTuple, GroupingKey};
use crate::repository::PgArtifactStore;
use crate::retention::ArtifactRetention;
use crate::service::RuleSyncService;

/// 规则同步命令行工具
#[derive(Parser, Debug)]
#[command(name = "rule-sync")]
#[command(version, about = "定向规则编译与元数据同步工具")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 分组键参数
#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    /// 规则族 (price_factor, floor, bid_caching, looping_ratio, dpo)
    #[arg(short, long)]
    pub family: RuleFamily,

    #[arg(short, long)]
    pub publisher: String,

    #[arg(short, long)]
    pub domain: String,

    /// 移动端分组
    #[arg(long)]
    pub mobile: bool,
}

impl KeyArgs {
    pub fn grouping_key(&self) -> GroupingKey {
        let normalized = compiler::normalize(&DimensionTuple::new(&self.publisher, &self.domain));
        GroupingKey::new(
            self.family,
            normalized.publisher,
            normalized.domain,
            self.mobile,
        )
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 执行数据库迁移
    Migrate,

    /// 从 JSON 文件批量写入规则并发布
    ///
    /// 文件内容为规则数组，每项包含 publisher、domain、可选细分维度与 value。
    Apply {
        #[arg(short, long)]
        family: RuleFamily,

        /// 规则文件路径
        #[arg(long)]
        file: PathBuf,

        /// 操作人
        #[arg(long, default_value = "rule-sync-cli")]
        actor: String,
    },

    /// 软删除规则并发布
    Deactivate {
        #[arg(short, long)]
        family: RuleFamily,

        /// 规则 ID，可重复
        #[arg(long = "id", required = true, num_args = 1..)]
        ids: Vec<Uuid>,

        #[arg(long, default_value = "rule-sync-cli")]
        actor: String,
    },

    /// 重新发布一个分组键
    Republish(KeyArgs),

    /// 查看分组键的当前制品
    Latest(KeyArgs),

    /// 清理旧制品，每个 key 保留最新的 N 个
    Compact {
        #[arg(long, default_value = "10")]
        keep: usize,
    },
}

/// 命令执行器
pub struct CommandRunner {
    db: Database,
    config: AppConfig,
}

impl CommandRunner {
    pub fn new(db: Database, config: AppConfig) -> Self {
        Self { db, config }
    }

    fn service(&self) -> Result<RuleSyncService> {
        RuleSyncService::with_pool(self.db.pool().clone(), &self.config.rule_sync)
            .context("构建同步服务失败")
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Migrate => self.run_migrate().await,
            Commands::Apply {
                family,
                file,
                actor,
            } => self.run_apply(family, &file, &actor).await,
            Commands::Deactivate { family, ids, actor } => {
                self.run_deactivate(family, &ids, &actor).await
            }
            Commands::Republish(key) => self.run_republish(&key).await,
            Commands::Latest(key) => self.run_latest(&key).await,
            Commands::Compact { keep } => self.run_compact(keep).await,
        }
    }

    async fn run_migrate(&self) -> Result<()> {
        self.db.run_migrations().await?;
        info!("Migrations applied");
        Ok(())
    }

    async fn run_apply(&self, family: RuleFamily, file: &Path, actor: &str) -> Result<()> {
        let inputs = load_inputs(file).await?;
        info!(family = %family, rules = inputs.len(), "Applying rules");

        let report = self.service()?.upsert_rules(actor, family, inputs).await?;
        print_json(&report)
    }

    async fn run_deactivate(&self, family: RuleFamily, ids: &[Uuid], actor: &str) -> Result<()> {
        let report = self.service()?.deactivate_rules(actor, family, ids).await?;
        print_json(&report)
    }

    async fn run_republish(&self, key: &KeyArgs) -> Result<()> {
        let artifact = self.service()?.republish(&key.grouping_key()).await?;
        print_json(&artifact)
    }

    async fn run_latest(&self, key: &KeyArgs) -> Result<()> {
        let key = key.grouping_key();
        match self.service()?.latest(&key).await? {
            Some(artifact) => print_json(&artifact),
            None => {
                println!("{} 尚无已发布的制品", key);
                Ok(())
            }
        }
    }

    async fn run_compact(&self, keep: usize) -> Result<()> {
        let store = Arc::new(PgArtifactStore::new(self.db.pool().clone()));
        let deleted = ArtifactRetention::new(store).compact(keep).await?;
        println!("已删除 {} 个旧制品", deleted);
        Ok(())
    }
}

/// 读取规则文件
pub async fn load_inputs(file: &Path) -> Result<Vec<RuleInput>> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("读取规则文件失败: {}", file.display()))?;
    parse_inputs(&content).with_context(|| format!("解析规则文件失败: {}", file.display()))
}

fn parse_inputs(content: &str) -> Result<Vec<RuleInput>> {
    Ok(serde_json::from_str(content)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
