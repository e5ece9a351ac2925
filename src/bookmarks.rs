use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    hash::Hash,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Instant,
};

#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: u64,

    pub title: String,
    pub description: String,
    pub url: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,

    /// Stored attachment identifiers
    pub files: Vec<String>,

    pub view_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hash for Bookmark {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialEq for Bookmark {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BookmarkCreate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BookmarkUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// `Some("")` clears the url
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// `Some("")` clears the category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_files: Vec<String>,
}

impl BookmarkUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.url.is_none()
            && self.category.is_none()
            && self.tags.is_none()
            && self.append_tags.is_none()
            && self.add_files.is_empty()
            && self.remove_files.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SearchQuery {
    pub id: Option<u64>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub keyword: Option<String>,

    #[serde(default)]
    pub exact: bool,

    #[serde(default)]
    pub limit: Option<usize>,
}

/// The relational store of bookmarks.
pub trait BookmarkManager: Send + Sync {
    fn search(&self, query: SearchQuery) -> anyhow::Result<Vec<Bookmark>>;
    fn get(&self, id: u64) -> anyhow::Result<Option<Bookmark>>;
    fn get_many(&self, ids: &[u64]) -> anyhow::Result<Vec<Option<Bookmark>>>;
    fn all(&self) -> anyhow::Result<Vec<Bookmark>>;
    fn create(&self, bookmark: BookmarkCreate) -> anyhow::Result<Bookmark>;
    fn update(&self, id: u64, update: BookmarkUpdate) -> anyhow::Result<Bookmark>;
    fn increment_views(&self, id: u64) -> anyhow::Result<Bookmark>;
    fn delete(&self, id: u64) -> anyhow::Result<Option<Bookmark>>;
}

pub fn parse_tags(tags: String) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.split(',')
        .flat_map(|value| value.split(' ').filter(|value| !value.is_empty()))
        .map(|s| s.to_lowercase())
        .filter(|tag| seen.insert(tag.clone()))
        .collect::<Vec<_>>()
}

fn dedup_tags(tags: &mut Vec<String>) {
    let mut seen = HashSet::new();
    tags.retain(|item| seen.insert(item.clone()));
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

impl SearchQuery {
    pub fn lowercase(&mut self) {
        self.title = self.title.as_ref().map(|title| title.to_lowercase());
        self.category = self.category.as_ref().map(|c| c.to_lowercase());
        self.tags = self
            .tags
            .as_ref()
            .map(|tags| tags.iter().map(|t| t.to_lowercase()).collect::<Vec<_>>());
        self.keyword = self.keyword.as_ref().map(|keyword| keyword.to_lowercase());
    }

    fn is_match_all(&self) -> bool {
        self.id.is_none()
            && self.title.is_none()
            && self.category.is_none()
            && self.tags.as_ref().map(|t| t.is_empty()).unwrap_or(true)
            && self.keyword.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct BackendCsv {
    list: Arc<RwLock<Vec<Bookmark>>>,
    next_id: Arc<RwLock<u64>>,
    path: PathBuf,
}

const CSV_HEADERS: [&str; 10] = [
    "id",
    "url",
    "title",
    "description",
    "category",
    "tags",
    "files",
    "view_count",
    "created_at",
    "updated_at",
];

fn field<'a>(record: &'a csv::StringRecord, idx: usize) -> anyhow::Result<&'a str> {
    record
        .get(idx)
        .ok_or_else(|| anyhow!("couldnt get record {}", CSV_HEADERS[idx]))
}

fn parse_record(record: &csv::StringRecord) -> anyhow::Result<Bookmark> {
    let files = field(record, 6)?;
    let files: Vec<String> = if files.is_empty() {
        vec![]
    } else {
        serde_json::from_str(files)?
    };

    Ok(Bookmark {
        id: field(record, 0)?.parse::<u64>()?,
        url: non_empty(field(record, 1)?.to_string()),
        title: field(record, 2)?.to_string(),
        description: field(record, 3)?.to_string(),
        category: non_empty(field(record, 4)?.to_string()),
        tags: parse_tags(field(record, 5)?.to_string()),
        files,
        view_count: field(record, 7)?.parse::<u64>()?,
        created_at: DateTime::parse_from_rfc3339(field(record, 8)?)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(field(record, 9)?)?.with_timezone(&Utc),
    })
}

impl BackendCsv {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new database at {}", path.display());
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(path)?;

        let mut bmarks = vec![];
        for record in csv_reader.records() {
            bmarks.push(parse_record(&record?)?);
        }

        log::debug!(
            "took {}ms to read csv",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        let next_id = bmarks.iter().map(|b| b.id + 1).max().unwrap_or(0);

        Ok(BackendCsv {
            list: Arc::new(RwLock::new(bmarks)),
            next_id: Arc::new(RwLock::new(next_id)),
            path: path.to_path_buf(),
        })
    }

    fn save(&self, bmarks: &[Bookmark]) -> anyhow::Result<()> {
        let temp_path = self.path.with_extension("csv-tmp");
        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for bmark in bmarks.iter() {
            let files = if bmark.files.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&bmark.files)?
            };

            let id = bmark.id.to_string();
            let tags = bmark.tags.join(",");
            let view_count = bmark.view_count.to_string();
            let created_at = bmark.created_at.to_rfc3339();
            let updated_at = bmark.updated_at.to_rfc3339();

            csv_wrt.write_record([
                id.as_str(),
                bmark.url.as_deref().unwrap_or_default(),
                bmark.title.as_str(),
                bmark.description.as_str(),
                bmark.category.as_deref().unwrap_or_default(),
                tags.as_str(),
                files.as_str(),
                view_count.as_str(),
                created_at.as_str(),
                updated_at.as_str(),
            ])?;
        }
        csv_wrt.flush()?;
        drop(csv_wrt);
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn modify<F>(&self, id: u64, f: F) -> anyhow::Result<Bookmark>
    where
        F: FnOnce(&mut Bookmark),
    {
        let mut bmarks = self.list.write().map_err(|_| anyhow!("bookmark list poisoned"))?;

        let bmark = bmarks
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| anyhow!("Bookmark with id {} not found", id))?;

        f(bmark);
        let result = bmark.clone();

        self.save(&bmarks)?;

        Ok(result)
    }

    fn read_list(&self) -> anyhow::Result<std::sync::RwLockReadGuard<'_, Vec<Bookmark>>> {
        self.list.read().map_err(|_| anyhow!("bookmark list poisoned"))
    }

    #[cfg(test)]
    pub fn wipe_database(self) -> Self {
        let _ = std::fs::remove_file(&self.path);
        if let Ok(mut list) = self.list.write() {
            list.clear();
        }
        self
    }
}

impl BookmarkManager for BackendCsv {
    fn create(&self, bmark_create: BookmarkCreate) -> anyhow::Result<Bookmark> {
        let mut bmarks = self.list.write().map_err(|_| anyhow!("bookmark list poisoned"))?;
        let mut next_id = self.next_id.write().map_err(|_| anyhow!("id counter poisoned"))?;

        let mut tags = bmark_create.tags.unwrap_or_default();
        dedup_tags(&mut tags);

        let now = Utc::now();
        let bmark = Bookmark {
            id: *next_id,
            title: bmark_create.title.unwrap_or_default(),
            description: bmark_create.description.unwrap_or_default(),
            url: bmark_create.url.and_then(non_empty),
            category: bmark_create.category.and_then(non_empty),
            tags,
            files: bmark_create.files,
            view_count: 0,
            created_at: now,
            updated_at: now,
        };

        bmarks.push(bmark.clone());
        self.save(&bmarks)?;
        *next_id += 1;

        Ok(bmark)
    }

    fn delete(&self, id: u64) -> anyhow::Result<Option<Bookmark>> {
        let mut bmarks = self.list.write().map_err(|_| anyhow!("bookmark list poisoned"))?;
        let removed = bmarks
            .iter()
            .position(|b| b.id == id)
            .map(|idx| bmarks.remove(idx));

        if removed.is_some() {
            self.save(&bmarks)?;
        }

        Ok(removed)
    }

    fn update(&self, id: u64, bmark_update: BookmarkUpdate) -> anyhow::Result<Bookmark> {
        self.modify(id, |bmark| {
            if let Some(title) = bmark_update.title {
                bmark.title = title;
            }
            if let Some(descr) = bmark_update.description {
                bmark.description = descr;
            }
            if let Some(url) = bmark_update.url {
                bmark.url = non_empty(url);
            }
            if let Some(category) = bmark_update.category {
                bmark.category = non_empty(category);
            }

            if let Some(tags) = bmark_update.tags {
                bmark.tags = tags;
                dedup_tags(&mut bmark.tags);
            }

            if let Some(mut tags) = bmark_update.append_tags {
                bmark.tags.append(&mut tags);
                dedup_tags(&mut bmark.tags);
            }

            bmark
                .files
                .retain(|file| !bmark_update.remove_files.contains(file));
            bmark.files.extend(bmark_update.add_files);

            bmark.updated_at = Utc::now();
        })
    }

    fn increment_views(&self, id: u64) -> anyhow::Result<Bookmark> {
        self.modify(id, |bmark| bmark.view_count += 1)
    }

    fn get(&self, id: u64) -> anyhow::Result<Option<Bookmark>> {
        Ok(self.read_list()?.iter().find(|b| b.id == id).cloned())
    }

    fn get_many(&self, ids: &[u64]) -> anyhow::Result<Vec<Option<Bookmark>>> {
        let bmarks = self.read_list()?;
        Ok(ids
            .iter()
            .map(|id| bmarks.iter().find(|b| b.id == *id).cloned())
            .collect())
    }

    fn all(&self) -> anyhow::Result<Vec<Bookmark>> {
        Ok(self.read_list()?.clone())
    }

    fn search(&self, query: SearchQuery) -> anyhow::Result<Vec<Bookmark>> {
        let bmarks = self.read_list()?;

        let mut query = query;
        query.lowercase();

        // return all
        if query.is_match_all() {
            let limit = query.limit.unwrap_or(usize::MAX);
            return Ok(bmarks.iter().take(limit).cloned().collect());
        }

        let mut output = vec![];

        for bookmark in bmarks.iter() {
            if let Some(id) = &query.id {
                if bookmark.id != *id {
                    continue;
                }
            };

            if let Some(title) = &query.title {
                let matches = if query.exact {
                    bookmark.title.eq_ignore_ascii_case(title)
                } else {
                    bookmark.title.to_lowercase().contains(title)
                };
                if !matches {
                    continue;
                }
            };

            if let Some(category) = &query.category {
                let bmark_category = bookmark
                    .category
                    .as_deref()
                    .unwrap_or_default()
                    .to_lowercase();
                if &bmark_category != category {
                    continue;
                }
            };

            let bmark_tags = bookmark
                .tags
                .iter()
                .map(|t| t.to_lowercase())
                .collect::<Vec<_>>();

            if let Some(tags) = &query.tags {
                if !tags.iter().all(|tag| bmark_tags.contains(tag)) {
                    continue;
                }
            };

            // Keyword search - every keyword must appear in some field
            if let Some(keyword) = &query.keyword {
                let title = bookmark.title.to_lowercase();
                let description = bookmark.description.to_lowercase();
                let url = bookmark.url.as_deref().unwrap_or_default().to_lowercase();
                let category = bookmark
                    .category
                    .as_deref()
                    .unwrap_or_default()
                    .to_lowercase();

                let keywords_match = keyword.split_whitespace().all(|keyword| {
                    bmark_tags.iter().any(|tag| tag.contains(keyword))
                        || title.contains(keyword)
                        || description.contains(keyword)
                        || url.contains(keyword)
                        || category.contains(keyword)
                        || bookmark
                            .files
                            .iter()
                            .any(|f| f.to_lowercase().contains(keyword))
                });

                if !keywords_match {
                    continue;
                }
            };

            output.push(bookmark.clone());

            let id_query = query.id.is_some();
            let limit_reached = query.limit.is_some_and(|limit| output.len() >= limit);

            if id_query || limit_reached {
                break;
            }
        }

        Ok(output)
    }
}
