//! 插件依赖图
//!
//! 邻接表只保留当前批次内存在的依赖；三色 DFS 求拓扑序，遇到"访问中"节点即为环。

use std::collections::{BTreeMap, HashMap};

use super::descriptor::PluginDescriptor;
use super::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// 插件依赖图：插件 ID -> 它依赖的插件 ID（批次内、按声明顺序）
pub struct PluginGraph {
    pub edges: BTreeMap<String, Vec<String>>,
}

impl PluginGraph {
    pub fn new(descriptors: &BTreeMap<String, PluginDescriptor>) -> Self {
        let mut edges = BTreeMap::new();
        for (id, descriptor) in descriptors {
            let mut deps = Vec::new();
            for dep in &descriptor.dependencies {
                if !descriptors.contains_key(dep) {
                    tracing::warn!("Plugin {} depends on missing plugin {}; ignoring", id, dep);
                    continue;
                }
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            edges.insert(id.clone(), deps);
        }
        Self { edges }
    }

    /// 依赖在前的加载顺序；有环时返回环路径（首尾相同）
    pub fn topological_order(&self) -> Result<Vec<String>, PluginError> {
        let mut marks: HashMap<&str, Mark> = self.edges.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();
        let mut order = Vec::with_capacity(self.edges.len());
        let mut path: Vec<&str> = Vec::new();

        for id in self.edges.keys() {
            if marks.get(id.as_str()) == Some(&Mark::Unvisited) {
                self.visit(id, &mut marks, &mut path, &mut order)?;
            }
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), PluginError> {
        match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Err(PluginError::CircularDependency(cycle));
            }
            Mark::Unvisited => {}
        }

        marks.insert(id, Mark::InProgress);
        path.push(id);
        if let Some(deps) = self.edges.get(id) {
            for dep in deps {
                self.visit(dep, marks, path, order)?;
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        order.push(id.to_string());
        Ok(())
    }
}

/// 计算加载顺序
pub fn resolve_load_order(descriptors: &BTreeMap<String, PluginDescriptor>) -> Result<Vec<String>, PluginError> {
    PluginGraph::new(descriptors).topological_order()
}
