use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Map, Value, json};

use super::error::BookmarkError;
use super::types::CheckResult;

/// Root folders of a Chromium profile, in the order the browser shows them.
const ROOTS: [&str; 3] = ["bookmark_bar", "other", "synced"];
/// Id Chromium gives the invisible node above the roots.
const ROOT_PARENT_ID: &str = "0";
/// Microseconds between 1601-01-01 and the Unix epoch.
const WINDOWS_EPOCH_OFFSET_MICROS: i64 = 11_644_473_600_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BookmarkNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    /// `None` for folders.
    pub url: Option<String>,
    pub children: Vec<BookmarkNode>,
}

impl BookmarkNode {
    pub fn is_folder(&self) -> bool {
        self.url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub id: String,
    pub title: String,
    pub depth: usize,
}

pub trait BookmarkStore: Send + Sync {
    /// The root folders with their full subtrees.
    fn list_all(&self) -> Result<Vec<BookmarkNode>, BookmarkError>;
    fn remove(&self, id: &str) -> Result<(), BookmarkError>;
    fn create(
        &self,
        parent_id: &str,
        title: &str,
        url: Option<&str>,
    ) -> Result<BookmarkNode, BookmarkError>;

    fn find_by_url(&self, url: &str) -> Result<Option<String>, BookmarkError> {
        Ok(find_url(&self.list_all()?, url))
    }
}

fn find_url(nodes: &[BookmarkNode], url: &str) -> Option<String> {
    nodes.iter().find_map(|node| {
        if node.url.as_deref() == Some(url) {
            Some(node.id.clone())
        } else {
            find_url(&node.children, url)
        }
    })
}

/// Every bookmark with a URL, depth-first in document order. With a folder
/// id, only bookmarks below that folder are kept.
pub fn collect_candidates(nodes: &[BookmarkNode], folder: Option<&str>) -> Vec<CheckResult> {
    let mut out = Vec::new();
    let mut ancestors = Vec::new();
    walk_candidates(nodes, folder, &mut ancestors, &mut out);
    out
}

fn walk_candidates<'a>(
    nodes: &'a [BookmarkNode],
    folder: Option<&str>,
    ancestors: &mut Vec<&'a str>,
    out: &mut Vec<CheckResult>,
) {
    for node in nodes {
        if let Some(url) = &node.url {
            let in_scope = folder.is_none_or(|id| ancestors.iter().any(|a| *a == id));
            if in_scope {
                out.push(CheckResult::pending(node.title.clone(), url.clone()));
            }
        }
        if !node.children.is_empty() {
            ancestors.push(&node.id);
            walk_candidates(&node.children, folder, ancestors, out);
            ancestors.pop();
        }
    }
}

pub fn folders(nodes: &[BookmarkNode]) -> Vec<FolderEntry> {
    fn walk(nodes: &[BookmarkNode], depth: usize, out: &mut Vec<FolderEntry>) {
        for node in nodes.iter().filter(|n| n.is_folder()) {
            out.push(FolderEntry {
                id: node.id.clone(),
                title: node.title.clone(),
                depth,
            });
            walk(&node.children, depth + 1, out);
        }
    }
    let mut out = Vec::new();
    walk(nodes, 0, &mut out);
    out
}

pub fn find_folder<'a>(nodes: &'a [BookmarkNode], id: &str) -> Option<&'a BookmarkNode> {
    nodes.iter().find_map(|node| {
        if node.id == id && node.is_folder() {
            Some(node)
        } else {
            find_folder(&node.children, id)
        }
    })
}

/// A Chromium `Bookmarks` file. Every call re-reads the file so edits made
/// by the browser in between are not lost; writes go through a temp file.
pub struct ChromeBookmarks {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ChromeBookmarks {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes an empty profile file if none exists yet.
    pub fn create_empty(path: impl Into<PathBuf>) -> Result<Self, BookmarkError> {
        let store = Self::new(path);
        if !store.path.exists() {
            let mut roots = Map::new();
            for (idx, key) in ROOTS.iter().enumerate() {
                roots.insert(
                    key.to_string(),
                    folder_json(&(idx + 1).to_string(), root_title(key)),
                );
            }
            store.write(json!({ "roots": roots, "version": 1 }))?;
        }
        Ok(store)
    }

    fn read(&self) -> Result<Value, BookmarkError> {
        let raw = fs::read_to_string(&self.path)?;
        let doc: Value = serde_json::from_str(&raw)?;
        if !doc.get("roots").is_some_and(Value::is_object) {
            return Err(BookmarkError::MissingRoots);
        }
        Ok(doc)
    }

    fn write(&self, mut doc: Value) -> Result<(), BookmarkError> {
        if let Some(object) = doc.as_object_mut() {
            // stale once we edit; the browser recomputes a missing checksum
            object.remove("checksum");
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn roots_mut(doc: &mut Value) -> Result<&mut Map<String, Value>, BookmarkError> {
        doc.get_mut("roots")
            .and_then(Value::as_object_mut)
            .ok_or(BookmarkError::MissingRoots)
    }
}

impl BookmarkStore for ChromeBookmarks {
    fn list_all(&self) -> Result<Vec<BookmarkNode>, BookmarkError> {
        let doc = self.read()?;
        let roots = doc
            .get("roots")
            .and_then(Value::as_object)
            .ok_or(BookmarkError::MissingRoots)?;
        Ok(ROOTS
            .iter()
            .filter_map(|key| roots.get(*key))
            .map(|root| to_node(root, Some(ROOT_PARENT_ID)))
            .collect())
    }

    fn remove(&self, id: &str) -> Result<(), BookmarkError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.read()?;
        let roots = Self::roots_mut(&mut doc)?;
        if roots.values().any(|root| node_id(root) == Some(id)) {
            return Err(BookmarkError::ProtectedRoot(id.to_string()));
        }
        let removed = roots.values_mut().find_map(|root| remove_child(root, id));
        if removed.is_none() {
            return Err(BookmarkError::NotFound(id.to_string()));
        }
        self.write(doc)?;
        tracing::debug!(id, "bookmark removed");
        Ok(())
    }

    fn create(
        &self,
        parent_id: &str,
        title: &str,
        url: Option<&str>,
    ) -> Result<BookmarkNode, BookmarkError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.read()?;
        let next_id = max_id(&doc["roots"]) + 1;
        let roots = Self::roots_mut(&mut doc)?;
        let parent = roots
            .values_mut()
            .find_map(|root| find_node_mut(root, parent_id))
            .ok_or_else(|| BookmarkError::NotFound(parent_id.to_string()))?;
        if parent.get("type").and_then(Value::as_str) != Some("folder") {
            return Err(BookmarkError::NotAFolder(parent_id.to_string()));
        }

        let id = next_id.to_string();
        let entry = match url {
            Some(url) => json!({
                "date_added": chrome_timestamp(),
                "id": id,
                "name": title,
                "type": "url",
                "url": url,
            }),
            None => folder_json(&id, title),
        };
        let node = to_node(&entry, Some(parent_id));
        match parent.get_mut("children").and_then(Value::as_array_mut) {
            Some(children) => children.push(entry),
            None => {
                if let Some(object) = parent.as_object_mut() {
                    object.insert("children".into(), Value::Array(vec![entry]));
                }
            }
        }
        self.write(doc)?;
        tracing::debug!(id = %node.id, parent_id, "bookmark created");
        Ok(node)
    }
}

fn folder_json(id: &str, title: &str) -> Value {
    json!({
        "children": [],
        "date_added": chrome_timestamp(),
        "date_modified": "0",
        "id": id,
        "name": title,
        "type": "folder",
    })
}

fn root_title(key: &str) -> &'static str {
    match key {
        "bookmark_bar" => "Bookmarks bar",
        "other" => "Other bookmarks",
        _ => "Mobile bookmarks",
    }
}

fn chrome_timestamp() -> String {
    (Utc::now().timestamp_micros() + WINDOWS_EPOCH_OFFSET_MICROS).to_string()
}

fn node_id(node: &Value) -> Option<&str> {
    node.get("id").and_then(Value::as_str)
}

fn to_node(value: &Value, parent_id: Option<&str>) -> BookmarkNode {
    let id = node_id(value).unwrap_or_default().to_string();
    let url = match value.get("type").and_then(Value::as_str) {
        Some("folder") => None,
        _ => value.get("url").and_then(Value::as_str).map(str::to_string),
    };
    let children = value
        .get("children")
        .and_then(Value::as_array)
        .map(|children| {
            children
                .iter()
                .map(|child| to_node(child, Some(&id)))
                .collect()
        })
        .unwrap_or_default();
    BookmarkNode {
        parent_id: parent_id.map(str::to_string),
        title: value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        url,
        children,
        id,
    }
}

fn find_node_mut<'a>(node: &'a mut Value, id: &str) -> Option<&'a mut Value> {
    if node_id(node) == Some(id) {
        return Some(node);
    }
    node.get_mut("children")?
        .as_array_mut()?
        .iter_mut()
        .find_map(|child| find_node_mut(child, id))
}

fn remove_child(node: &mut Value, id: &str) -> Option<Value> {
    let children = node.get_mut("children")?.as_array_mut()?;
    if let Some(pos) = children.iter().position(|child| node_id(child) == Some(id)) {
        return Some(children.remove(pos));
    }
    children.iter_mut().find_map(|child| remove_child(child, id))
}

fn max_id(value: &Value) -> u64 {
    match value {
        Value::Object(object) => {
            let own = object
                .get("id")
                .and_then(Value::as_str)
                .and_then(|id| id.parse::<u64>().ok())
                .unwrap_or(0);
            object.values().map(max_id).fold(own, u64::max)
        }
        Value::Array(items) => items.iter().map(max_id).max().unwrap_or(0),
        _ => 0,
    }
}

/// The default Chrome profile's bookmark file for this platform.
pub fn default_bookmarks_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    let base = dirs::data_dir().map(|dir| dir.join("Google").join("Chrome"));
    #[cfg(target_os = "windows")]
    let base = dirs::data_local_dir().map(|dir| dir.join("Google").join("Chrome").join("User Data"));
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let base = dirs::config_dir().map(|dir| dir.join("google-chrome"));

    base.map(|dir| dir.join("Default").join("Bookmarks"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Value {
        json!({
            "checksum": "0123abcd",
            "roots": {
                "bookmark_bar": {
                    "id": "1", "name": "Bookmarks bar", "type": "folder",
                    "children": [
                        {"id": "4", "name": "Rust", "type": "url", "url": "https://www.rust-lang.org/"},
                        {"id": "5", "name": "Work", "type": "folder", "children": [
                            {"id": "6", "name": "Tracker", "type": "url", "url": "https://tracker.example/"},
                            {"id": "9", "name": "Old", "type": "folder", "children": [
                                {"id": "10", "name": "Gone", "type": "url", "url": "http://gone.example/"}
                            ]}
                        ]}
                    ]
                },
                "other": {
                    "id": "2", "name": "Other bookmarks", "type": "folder",
                    "children": [
                        {"id": "7", "name": "Docs", "type": "url", "url": "https://docs.rs/", "meta_info": {"k": "v"}}
                    ]
                },
                "synced": {"id": "3", "name": "Mobile bookmarks", "type": "folder", "children": []}
            },
            "version": 1
        })
    }

    fn store_with(doc: Value) -> (tempfile::TempDir, ChromeBookmarks) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Bookmarks");
        fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();
        (dir, ChromeBookmarks::new(path))
    }

    fn urls(candidates: &[CheckResult]) -> Vec<&str> {
        candidates.iter().map(|c| c.url.as_str()).collect()
    }

    #[test]
    fn candidates_follow_document_order() {
        let (_dir, store) = store_with(sample());
        let tree = store.list_all().unwrap();
        assert_eq!(
            urls(&collect_candidates(&tree, None)),
            vec![
                "https://www.rust-lang.org/",
                "https://tracker.example/",
                "http://gone.example/",
                "https://docs.rs/",
            ]
        );
        assert_eq!(tree[0].parent_id.as_deref(), Some("0"));
        assert_eq!(tree[0].children[1].children[0].parent_id.as_deref(), Some("5"));
    }

    #[test]
    fn folder_filter_includes_nested_folders() {
        let (_dir, store) = store_with(sample());
        let tree = store.list_all().unwrap();
        assert_eq!(
            urls(&collect_candidates(&tree, Some("5"))),
            vec!["https://tracker.example/", "http://gone.example/"]
        );
        assert!(collect_candidates(&tree, Some("3")).is_empty());
    }

    #[test]
    fn folders_are_listed_with_depth() {
        let (_dir, store) = store_with(sample());
        let listed: Vec<(String, usize)> = folders(&store.list_all().unwrap())
            .into_iter()
            .map(|f| (f.id, f.depth))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("1".to_string(), 0),
                ("5".to_string(), 1),
                ("9".to_string(), 2),
                ("2".to_string(), 0),
                ("3".to_string(), 0),
            ]
        );
    }

    #[test]
    fn remove_rewrites_file_and_keeps_unknown_fields() {
        let (_dir, store) = store_with(sample());
        store.remove("10").unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(raw.get("checksum").is_none());
        assert_eq!(raw["roots"]["other"]["children"][0]["meta_info"]["k"], "v");
        assert_eq!(store.find_by_url("http://gone.example/").unwrap(), None);
        assert!(matches!(
            store.remove("10"),
            Err(BookmarkError::NotFound(_))
        ));
        assert!(matches!(
            store.remove("2"),
            Err(BookmarkError::ProtectedRoot(_))
        ));
    }

    #[test]
    fn create_assigns_next_id() {
        let (_dir, store) = store_with(sample());
        let node = store
            .create("9", "New", Some("https://new.example/"))
            .unwrap();
        assert_eq!(node.id, "11");
        assert_eq!(node.parent_id.as_deref(), Some("9"));
        assert_eq!(
            store.find_by_url("https://new.example/").unwrap().as_deref(),
            Some("11")
        );

        let folder = store.create("2", "Archive", None).unwrap();
        assert!(folder.is_folder());
        assert!(matches!(
            store.create("4", "x", None),
            Err(BookmarkError::NotAFolder(_))
        ));
        assert!(matches!(
            store.create("404", "x", None),
            Err(BookmarkError::NotFound(_))
        ));
    }

    #[test]
    fn missing_roots_is_an_error() {
        let (_dir, store) = store_with(json!({"version": 1}));
        assert!(matches!(store.list_all(), Err(BookmarkError::MissingRoots)));
    }

    #[test]
    fn empty_profile_has_three_roots() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChromeBookmarks::create_empty(dir.path().join("p").join("Bookmarks")).unwrap();
        let tree = store.list_all().unwrap();
        assert_eq!(
            tree.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2", "3"]
        );
        assert!(collect_candidates(&tree, None).is_empty());
    }
}
