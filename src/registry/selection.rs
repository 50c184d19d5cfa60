//! 服务选择：兼容度评分、负载评分、选择策略
//!
//! final = compatibility × (1 − load)，降序稳定排序，平局按注册顺序。

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::GENERAL;
use super::service::ServiceMetrics;

/// 选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// 按综合分取前 N
    #[default]
    BestMatch,
    /// 在匹配集合内按负载重新排序后取前 N
    LeastLoaded,
    /// 在匹配集合内循环偏移，偏移量按候选集合签名记忆
    RoundRobin,
    /// 返回所有匹配
    All,
}

/// 参与评分的候选服务
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    /// 注册序号（平局时的次序）
    pub seq: u64,
    pub capabilities: Vec<String>,
    pub load: f64,
}

/// 评分结果（可解释的排名）
#[derive(Debug, Clone, Serialize)]
pub struct Ranked {
    pub id: String,
    #[serde(skip)]
    pub seq: u64,
    pub compatibility: f64,
    pub load: f64,
    pub score: f64,
}

/// 兼容度：精确命中 1.0，子串部分命中 0.5，按需求数归一化并封顶 1.0；
/// 无需求时声明 general 的服务得 1.0，其余 0.5
pub fn compatibility_score(required: &[String], capabilities: &[String]) -> f64 {
    if required.is_empty() {
        return if capabilities.iter().any(|c| c == GENERAL) {
            1.0
        } else {
            0.5
        };
    }

    let total: f64 = required
        .iter()
        .map(|req| {
            if capabilities.iter().any(|c| c == req) {
                1.0
            } else if capabilities
                .iter()
                .any(|c| c.contains(req.as_str()) || req.contains(c.as_str()))
            {
                0.5
            } else {
                0.0
            }
        })
        .sum();

    (total / required.len() as f64).min(1.0)
}

/// 负载评分 [0,1)：最近平均延迟越高负载越高，距最近一次请求越久越衰减
pub fn load_score(
    metrics: &ServiceMetrics,
    now: DateTime<Utc>,
    latency_scale_ms: f64,
    decay_secs: f64,
) -> f64 {
    let Some(last) = metrics.last_request_at else {
        return 0.0;
    };
    if metrics.avg_latency_ms <= 0.0 || latency_scale_ms <= 0.0 {
        return 0.0;
    }

    let idle_secs = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
    let decay = if decay_secs > 0.0 {
        (-idle_secs / decay_secs).exp()
    } else {
        1.0
    };
    let effective = metrics.avg_latency_ms * decay;
    (1.0 - (-effective / latency_scale_ms).exp()).clamp(0.0, 1.0)
}

/// 对候选打分：剔除兼容度为 0 的服务，按综合分降序（稳定，平局按注册顺序）
pub fn rank(required: &[String], candidates: &[Candidate]) -> Vec<Ranked> {
    let mut ranked: Vec<Ranked> = candidates
        .iter()
        .filter_map(|c| {
            let compatibility = compatibility_score(required, &c.capabilities);
            (compatibility > 0.0).then(|| Ranked {
                id: c.id.clone(),
                seq: c.seq,
                compatibility,
                load: c.load,
                score: compatibility * (1.0 - c.load),
            })
        })
        .collect();

    ranked.sort_by_key(|r| r.seq);
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    ranked
}

/// 候选集合签名（轮询偏移的键）
pub fn signature(ranked: &[Ranked]) -> String {
    let mut ids: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
    ids.sort_unstable();
    ids.join(",")
}

/// 应用策略；`rr_offset` 仅 RoundRobin 使用
pub fn apply_strategy(
    mut ranked: Vec<Ranked>,
    strategy: SelectionStrategy,
    count: usize,
    rr_offset: usize,
) -> Vec<Ranked> {
    let count = count.max(1);
    match strategy {
        SelectionStrategy::BestMatch => {
            ranked.truncate(count);
            ranked
        }
        SelectionStrategy::LeastLoaded => {
            ranked.sort_by_key(|r| r.seq);
            ranked.sort_by(|a, b| a.load.partial_cmp(&b.load).unwrap_or(Ordering::Equal));
            ranked.truncate(count);
            ranked
        }
        SelectionStrategy::RoundRobin => {
            if ranked.is_empty() {
                return ranked;
            }
            // 轮转基于注册顺序，不随负载重排
            ranked.sort_by_key(|r| r.seq);
            let len = ranked.len();
            let start = rr_offset % len;
            (0..count.min(len))
                .map(|i| ranked[(start + i) % len].clone())
                .collect()
        }
        SelectionStrategy::All => ranked,
    }
}
