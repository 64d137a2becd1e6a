//! 节点与节点池 (Registry) 领域模型
//!
//! 纯数据结构：节点租期计算、按节点的 last-write-wins 合并、删除墓碑

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

/// 一天的秒数
const SECS_PER_DAY: i64 = 86_400;

/// 将剩余时长向下取整为天数（负数同样向下取整）
pub fn floor_days(remaining: Duration) -> i64 {
    remaining.num_seconds().div_euclid(SECS_PER_DAY)
}

/// 由地址派生节点 ID
///
/// 同一地址在不同主机上添加时得到同一个 ID，合并时自然收敛
pub fn node_id_for(address: &str) -> String {
    let slug: String = address
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("node-{}", slug.trim_matches('-'))
}

/// 节点状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// 空闲，可作为迁移目标
    Idle,
    /// 当前承载服务
    Active,
    /// 已被锁定，正在接收迁移
    Transferring,
    /// 已退役
    Dead,
}

impl NodeStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Active => "active",
            NodeStatus::Transferring => "transferring",
            NodeStatus::Dead => "dead",
        }
    }

    /// 从字符串解析
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Some(NodeStatus::Idle),
            "active" => Some(NodeStatus::Active),
            "transferring" => Some(NodeStatus::Transferring),
            "dead" => Some(NodeStatus::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 候选主机
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub domain: String,
    pub added_at: DateTime<Utc>,
    /// 创建时计算一次：added_at + 租期
    pub expires_at: DateTime<Utc>,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
    /// 节点级最后写入时间，合并时据此裁决
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// 创建新的空闲节点
    pub fn new(
        address: impl Into<String>,
        domain: impl Into<String>,
        added_at: DateTime<Utc>,
        lease: Duration,
        notes: impl Into<String>,
    ) -> Self {
        let address = address.into();
        Self {
            id: node_id_for(&address),
            address,
            domain: domain.into(),
            added_at,
            expires_at: added_at + lease,
            status: NodeStatus::Idle,
            last_heartbeat: None,
            notes: notes.into(),
            updated_at: added_at,
        }
    }

    /// 剩余租期 = expires_at - now，负数表示已过期
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        floor_days(self.remaining(now))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now) < Duration::zero()
    }

    /// 状态变更，同时刷新心跳和写入时间
    pub fn set_status(&mut self, status: NodeStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_heartbeat = Some(now);
        self.updated_at = now;
    }

    /// 写入时间相同时的全序裁决键
    fn tie_key(&self) -> impl Ord + '_ {
        (
            self.status,
            &self.address,
            &self.domain,
            self.added_at,
            self.expires_at,
            self.last_heartbeat,
            &self.notes,
        )
    }
}

/// 删除墓碑
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Tombstone {
    id: String,
    deleted_at: DateTime<Utc>,
}

/// 节点池操作错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryEntryError {
    #[error("node already registered: {0}")]
    DuplicateId(String),
    #[error("node not found: {0}")]
    NotFound(String),
}

/// 节点池
///
/// 以节点 ID 为键的有序映射；删除以墓碑形式保留，参与 last-write-wins 合并
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registry {
    /// 单调递增的版本号：合并取最大值，本地变更加一
    #[serde(default)]
    pub version: u64,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(with = "node_list")]
    pub nodes: BTreeMap<String, Node>,
    #[serde(default, with = "tombstone_list")]
    pub tombstones: BTreeMap<String, DateTime<Utc>>,
}

/// 合并时某个 ID 的条目
#[derive(Clone, Copy)]
enum Entry<'a> {
    Live(&'a Node),
    Gone(DateTime<Utc>),
}

impl Entry<'_> {
    fn stamp(&self) -> DateTime<Utc> {
        match self {
            Entry::Live(node) => node.updated_at,
            Entry::Gone(at) => *at,
        }
    }
}

/// 两个条目取较新者；时间相同：墓碑优先，其次按节点字段全序
fn newer<'a>(a: Entry<'a>, b: Entry<'a>) -> Entry<'a> {
    match a.stamp().cmp(&b.stamp()) {
        Ordering::Greater => a,
        Ordering::Less => b,
        Ordering::Equal => match (a, b) {
            (Entry::Gone(_), _) => a,
            (_, Entry::Gone(_)) => b,
            (Entry::Live(x), Entry::Live(y)) => {
                if x.tie_key() >= y.tie_key() {
                    a
                } else {
                    b
                }
            }
        },
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn find_by_address(&self, address: &str) -> Option<&Node> {
        self.nodes.values().find(|n| n.address == address)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 按 added_at、id 排序的节点序列
    ///
    /// 返回的迭代器可 clone，用于重复遍历
    pub fn list(&self) -> std::vec::IntoIter<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
        nodes.into_iter()
    }

    /// 添加节点，ID 或地址已存在时失败
    pub fn insert(&mut self, mut node: Node, now: DateTime<Utc>) -> Result<(), RegistryEntryError> {
        if self.nodes.contains_key(&node.id) {
            return Err(RegistryEntryError::DuplicateId(node.id));
        }
        if let Some(existing) = self.find_by_address(&node.address) {
            return Err(RegistryEntryError::DuplicateId(existing.id.clone()));
        }
        node.updated_at = now;
        self.tombstones.remove(&node.id);
        self.nodes.insert(node.id.clone(), node);
        self.touch(now);
        Ok(())
    }

    /// 删除节点并留下墓碑
    pub fn remove(&mut self, id: &str, now: DateTime<Utc>) -> Result<Node, RegistryEntryError> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| RegistryEntryError::NotFound(id.to_string()))?;
        self.tombstones.insert(id.to_string(), now);
        self.touch(now);
        Ok(node)
    }

    /// 更新节点状态
    pub fn set_status(
        &mut self,
        id: &str,
        status: NodeStatus,
        now: DateTime<Utc>,
    ) -> Result<&Node, RegistryEntryError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| RegistryEntryError::NotFound(id.to_string()))?;
        node.set_status(status, now);
        self.version += 1;
        self.last_updated = Some(now);
        Ok(&self.nodes[id])
    }

    /// 将节点设为某域名的承载节点
    ///
    /// 同域名下其他 active 节点降级为 dead，返回被降级的 ID
    pub fn activate(
        &mut self,
        id: &str,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, RegistryEntryError> {
        if !self.nodes.contains_key(id) {
            return Err(RegistryEntryError::NotFound(id.to_string()));
        }

        let mut demoted = Vec::new();
        for node in self.nodes.values_mut() {
            if node.id == id {
                node.domain = domain.to_string();
                node.set_status(NodeStatus::Active, now);
            } else if node.status == NodeStatus::Active && node.domain == domain {
                node.set_status(NodeStatus::Dead, now);
                demoted.push(node.id.clone());
            }
        }
        self.touch(now);
        Ok(demoted)
    }

    /// 标记一次本地变更
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.last_updated = Some(now);
    }

    /// 按节点合并两份节点池（纯函数）
    ///
    /// 每个 ID 整体取较新的条目，不做字段级合并。
    /// 满足幂等 merge(R, R) = R 与交换律。
    pub fn merge(&self, other: &Registry) -> Registry {
        let mut merged = Registry {
            version: self.version.max(other.version),
            last_updated: self.last_updated.max(other.last_updated),
            nodes: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        };

        let ids = self
            .nodes
            .keys()
            .chain(self.tombstones.keys())
            .chain(other.nodes.keys())
            .chain(other.tombstones.keys());

        for id in ids {
            if merged.nodes.contains_key(id) || merged.tombstones.contains_key(id) {
                continue;
            }
            let winner = match (self.entry(id), other.entry(id)) {
                (Some(a), Some(b)) => newer(a, b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => continue,
            };
            match winner {
                Entry::Live(node) => {
                    merged.nodes.insert(id.clone(), node.clone());
                }
                Entry::Gone(at) => {
                    merged.tombstones.insert(id.clone(), at);
                }
            }
        }

        merged
    }

    fn entry(&self, id: &str) -> Option<Entry<'_>> {
        match (self.nodes.get(id), self.tombstones.get(id)) {
            (Some(node), Some(at)) => Some(newer(Entry::Live(node), Entry::Gone(*at))),
            (Some(node), None) => Some(Entry::Live(node)),
            (None, Some(at)) => Some(Entry::Gone(*at)),
            (None, None) => None,
        }
    }

    /// 清理早于 cutoff 的墓碑，返回清理数量
    pub fn prune_tombstones(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|_, at| *at >= cutoff);
        before - self.tombstones.len()
    }

    /// 内容摘要（不含 version / last_updated），用于判断是否需要推送
    pub fn content_digest(&self) -> String {
        let body = serde_json::json!({
            "nodes": self.nodes,
            "tombstones": self.tombstones,
        });
        let mut hasher = Sha256::new();
        hasher.update(body.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// nodes 在 JSON 中以数组形式保存
mod node_list {
    use super::*;

    pub fn serialize<S: Serializer>(nodes: &BTreeMap<String, Node>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(nodes.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, Node>, D::Error> {
        let list = Vec::<Node>::deserialize(d)?;
        let mut nodes: BTreeMap<String, Node> = BTreeMap::new();
        for node in list {
            // 重复 ID 取较新者
            let keep = nodes
                .get(&node.id)
                .map_or(true, |existing| node.updated_at > existing.updated_at);
            if keep {
                nodes.insert(node.id.clone(), node);
            }
        }
        Ok(nodes)
    }
}

mod tombstone_list {
    use super::*;

    pub fn serialize<S: Serializer>(
        tombstones: &BTreeMap<String, DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.collect_seq(tombstones.iter().map(|(id, at)| Tombstone {
            id: id.clone(),
            deleted_at: *at,
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<String, DateTime<Utc>>, D::Error> {
        let list = Vec::<Tombstone>::deserialize(d)?;
        let mut map: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for t in list {
            let entry = map.entry(t.id).or_insert(t.deleted_at);
            if t.deleted_at > *entry {
                *entry = t.deleted_at;
            }
        }
        Ok(map)
    }
}
