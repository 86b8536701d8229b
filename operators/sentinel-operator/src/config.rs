//! 配置管理模块
//!
//! Operator 的运行参数来自三层：内置默认值、可选的 YAML/JSON 配置文件、
//! 命令行参数与环境变量（优先级最高）。结果是一个不可变的 `OperatorOptions`，
//! 在构造时注入到各个协调器和渲染器中。

use clap::Parser;
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// 默认集群域名
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// 默认 Operator 命名空间
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "tigera-operator";

/// 命令行参数
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "sentinel-operator", version, about = "Sentinel 安全组件 Operator")]
pub struct Cli {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(long, env = "SENTINEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// 集群域名
    #[arg(long, env = "CLUSTER_DOMAIN")]
    pub cluster_domain: Option<String>,

    /// Operator 所在命名空间
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    pub operator_namespace: Option<String>,

    /// 使用外部（托管）Elasticsearch
    #[arg(long, env = "ELASTIC_EXTERNAL")]
    pub elastic_external: bool,

    /// 日志过滤表达式
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// 注入到 Manager 的额外环境变量，格式 NAME=VALUE，可重复
    #[arg(long = "manager-env")]
    pub manager_env: Vec<ExtraEnv>,

    /// 输出 CRD 定义后退出
    #[arg(long)]
    pub print_crds: bool,
}

/// 额外环境变量条目
///
/// 配置文件中的映射键会被统一转成小写，所以变量名放在值里而不是键里。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraEnv {
    pub name: String,
    pub value: String,
}

impl std::str::FromStr for ExtraEnv {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok(Self {
                name: name.to_string(),
                value: value.to_string(),
            }),
            _ => Err(format!("环境变量格式应为 NAME=VALUE: {}", s)),
        }
    }
}

/// Operator 运行参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorOptions {
    /// 集群域名
    pub cluster_domain: String,
    /// Operator 所在命名空间
    pub operator_namespace: String,
    /// 是否使用外部 Elasticsearch
    pub elastic_external: bool,
    /// 工作负载状态刷新间隔（秒）
    pub status_interval_seconds: u64,
    /// License API 探测间隔（秒）
    pub license_interval_seconds: u64,
    /// 注入到 Manager 容器的额外环境变量
    pub manager_extra_env: Vec<ExtraEnv>,
}

impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            elastic_external: false,
            status_interval_seconds: 10,
            license_interval_seconds: 10,
            manager_extra_env: Vec::new(),
        }
    }
}

impl OperatorOptions {
    /// 根据命令行参数加载配置
    pub fn load(cli: &Cli) -> Result<Self> {
        let options = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        Ok(options.with_overrides(cli))
    }

    /// 从配置文件加载
    pub fn from_file(path: &Path) -> Result<Self> {
        let name = path
            .to_str()
            .ok_or_else(|| Error::config(format!("配置路径无效: {:?}", path)))?;

        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(Error::config("不支持的配置文件格式，仅支持 YAML 或 JSON")),
        };

        debug!("加载配置文件 {}", name);
        Self::build(File::with_name(name).format(format))
    }

    /// 从 YAML 文本加载
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Self::build(File::from_str(content, FileFormat::Yaml))
    }

    fn build<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(source)
            .build()
            .and_then(|config| config.try_deserialize::<OperatorOptions>())
            .map_err(|e| Error::config(format!("配置格式错误: {}", e)))
    }

    /// 命令行参数覆盖配置文件中的值
    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(domain) = &cli.cluster_domain {
            self.cluster_domain = domain.clone();
        }
        if let Some(namespace) = &cli.operator_namespace {
            self.operator_namespace = namespace.clone();
        }
        if cli.elastic_external {
            self.elastic_external = true;
        }
        for env in &cli.manager_env {
            self.manager_extra_env.retain(|e| e.name != env.name);
            self.manager_extra_env.push(env.clone());
        }
        self
    }

    /// Manager 额外环境变量，按变量名排序，同名时后者覆盖前者
    pub fn manager_extra_env_map(&self) -> BTreeMap<String, String> {
        self.manager_extra_env
            .iter()
            .map(|env| (env.name.clone(), env.value.clone()))
            .collect()
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_seconds.max(1))
    }

    pub fn license_interval(&self) -> Duration {
        Duration::from_secs(self.license_interval_seconds.max(1))
    }
}
