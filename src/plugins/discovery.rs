//! 插件发现：只生成描述符，不加载任何东西
//!
//! 配置的位置可以含 glob 通配段（`plugins/*`、`vendor/*/plugins`）。
//! 展开后的路径本身带描述文件时视为插件目录，否则扫描其一级子目录。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::descriptor::{PluginDescriptor, PluginType};
use super::PluginError;
use crate::registry::infer_capabilities;

const DESCRIPTOR_TOML: &str = "plugin.toml";
const DESCRIPTOR_JSON: &str = "plugin.json";
const ENTRY_STEMS: &[&str] = &["main", "index", "service"];

fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// 展开配置位置；不存在的路径被忽略
pub fn expand_roots(patterns: &[String]) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for pattern in patterns {
        if has_wildcard(pattern) {
            match glob::glob(pattern) {
                Ok(paths) => {
                    for path in paths.flatten() {
                        if path.is_dir() && !roots.contains(&path) {
                            roots.push(path);
                        }
                    }
                }
                Err(e) => tracing::warn!("Invalid plugin location pattern {}: {}", pattern, e),
            }
        } else {
            let path = PathBuf::from(pattern);
            if path.is_dir() {
                if !roots.contains(&path) {
                    roots.push(path);
                }
            } else {
                tracing::debug!("Plugin location {} does not exist", pattern);
            }
        }
    }
    roots
}

fn is_plugin_dir(dir: &Path) -> bool {
    dir.join(DESCRIPTOR_TOML).is_file() || dir.join(DESCRIPTOR_JSON).is_file()
}

/// 插件目录列表（排序，保证发现顺序稳定）
pub fn plugin_dirs(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for root in roots {
        if is_plugin_dir(root) {
            dirs.push(root.clone());
            continue;
        }
        let children = WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path());
        dirs.extend(children);
    }
    dirs
}

/// 发现所有插件；单个目录的错误只记日志，重复 id 保留先发现的
pub fn discover(patterns: &[String]) -> BTreeMap<String, PluginDescriptor> {
    let roots = expand_roots(patterns);
    let mut found: BTreeMap<String, PluginDescriptor> = BTreeMap::new();

    for dir in plugin_dirs(&roots) {
        match read_plugin_dir(&dir) {
            Ok(Some(descriptor)) => {
                if let Some(existing) = found.get(&descriptor.id) {
                    tracing::warn!(
                        "Duplicate plugin id {} in {} (already found in {:?}); ignoring",
                        descriptor.id,
                        dir.display(),
                        existing.dir
                    );
                    continue;
                }
                tracing::debug!(
                    "Discovered plugin {} ({}) in {}",
                    descriptor.id,
                    descriptor.plugin_type,
                    dir.display()
                );
                found.insert(descriptor.id.clone(), descriptor);
            }
            Ok(None) => tracing::debug!("Skipping {}: not a plugin directory", dir.display()),
            Err(e) => tracing::warn!("Skipping plugin in {}: {}", dir.display(), e),
        }
    }

    tracing::info!("Discovered {} plugins", found.len());
    found
}

/// 读取单个插件目录：描述文件优先，否则推断；无法识别时返回 None
pub fn read_plugin_dir(dir: &Path) -> Result<Option<PluginDescriptor>, PluginError> {
    let toml_path = dir.join(DESCRIPTOR_TOML);
    let json_path = dir.join(DESCRIPTOR_JSON);

    let explicit = if toml_path.is_file() {
        let raw = std::fs::read_to_string(&toml_path)?;
        Some(PluginDescriptor::from_toml_str(&raw)?)
    } else if json_path.is_file() {
        let raw = std::fs::read_to_string(&json_path)?;
        Some(PluginDescriptor::from_json_str(&raw)?)
    } else {
        None
    };

    let descriptor = match explicit {
        Some(d) => Some(d),
        None => infer_descriptor(dir),
    };
    Ok(descriptor.map(|d| d.with_dir(dir)))
}

fn dir_files(dir: &Path) -> Vec<String> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect()
}

fn file_stem(name: &str) -> &str {
    name.split_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

/// 按命名与目录内容推断描述符
fn infer_descriptor(dir: &Path) -> Option<PluginDescriptor> {
    let id = dir.file_name()?.to_str()?.to_string();
    let lower = id.to_lowercase();
    let files = dir_files(dir);

    let workflow_file = files
        .iter()
        .find(|f| matches!(f.as_str(), "workflow.toml" | "workflow.json"))
        .cloned();
    let entry_file = files
        .iter()
        .filter(|f| ENTRY_STEMS.contains(&file_stem(f)))
        .min()
        .cloned();

    let (plugin_type, main) = if lower.contains("workflow") || workflow_file.is_some() {
        (PluginType::Workflow, workflow_file)
    } else if lower.contains("adapter") {
        (PluginType::Adapter, entry_file)
    } else if entry_file.is_some() {
        (PluginType::Service, entry_file)
    } else {
        return None;
    };

    let mut descriptor = PluginDescriptor::new(id.clone(), plugin_type)
        .with_capabilities(infer_capabilities(&id.replace(['_', '-'], " ")));
    descriptor.main = main;
    descriptor.inferred = true;
    Some(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_discover_explicit_and_inferred() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("plugins");
        write(
            &base.join("search/plugin.toml"),
            "[plugin]\nid = \"search\"\ntype = \"service\"\nmain = \"web_search\"\n",
        );
        write(&base.join("report-workflow/steps.md"), "");
        write(&base.join("slack-adapter/index.js"), "");
        write(&base.join("translator/main.py"), "");
        write(&base.join("notes/readme.txt"), "");

        let found = discover(&[base.to_string_lossy().into_owned()]);
        let ids: Vec<&str> = found.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["report-workflow", "search", "slack-adapter", "translator"]);

        assert!(!found["search"].inferred);
        assert_eq!(found["report-workflow"].plugin_type, PluginType::Workflow);
        assert_eq!(found["slack-adapter"].plugin_type, PluginType::Adapter);
        let translator = &found["translator"];
        assert!(translator.inferred);
        assert_eq!(translator.plugin_type, PluginType::Service);
        assert_eq!(translator.main.as_deref(), Some("main.py"));
        assert_eq!(translator.dir.as_deref(), Some(base.join("translator").as_path()));
    }

    #[test]
    fn test_glob_locations() {
        let root = tempfile::tempdir().unwrap();
        write(
            &root.path().join("vendor/a/plugins/one/plugin.json"),
            r#"{"id":"one","type":"adapter"}"#,
        );
        write(
            &root.path().join("vendor/b/plugins/two/plugin.json"),
            r#"{"id":"two","type":"adapter"}"#,
        );
        let pattern = format!("{}/vendor/*/plugins", root.path().display());
        let found = discover(&[pattern]);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_invalid_descriptor_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("bad/plugin.json"), r#"{"id":"bad"}"#);
        write(
            &root.path().join("good/plugin.json"),
            r#"{"id":"good","type":"service"}"#,
        );
        assert!(read_plugin_dir(&root.path().join("bad")).is_err());
        let found = discover(&[root.path().to_string_lossy().into_owned()]);
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["good"]);
    }

    #[test]
    fn test_workflow_file_marks_workflow() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("digest/workflow.json"), "{}");
        let d = read_plugin_dir(&root.path().join("digest")).unwrap().unwrap();
        assert_eq!(d.plugin_type, PluginType::Workflow);
        assert_eq!(d.main.as_deref(), Some("workflow.json"));
        assert!(d.capabilities.contains(&"summarization".to_string()));
    }
}
