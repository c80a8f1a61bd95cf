/// Star catalog: owns the detected stars and the sort/group indexes
use std::collections::{BTreeMap, HashMap};

use crate::geometry::Rect;
use crate::star::{RawStar, Star, DEFAULT_SIZE_CLASS_INTERVAL};

/// Default bucket interval for `group_by`
pub const DEFAULT_GROUP_INTERVAL: f64 = 2.0;

/// Stars bucketed by `round(value / interval) * interval`
#[derive(Debug, Clone, PartialEq)]
pub struct StarGroups {
    pub interval: f64,
    /// Bucket index -> catalog indexes, in sorted order
    buckets: BTreeMap<i64, Vec<usize>>,
}

impl StarGroups {
    /// Bucket keys (`index * interval`), ascending
    pub fn keys(&self) -> impl Iterator<Item = f64> + '_ {
        self.buckets.keys().map(move |&k| k as f64 * self.interval)
    }

    /// `(bucket key, catalog indexes)` pairs, ascending by key
    pub fn iter(&self) -> impl Iterator<Item = (f64, &[usize])> + '_ {
        self.buckets
            .iter()
            .map(move |(&k, v)| (k as f64 * self.interval, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Total number of grouped stars
    pub fn star_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Default)]
pub struct StarCatalog {
    stars: Vec<Star>,
    size_class_interval: f64,
    sorted: HashMap<String, Vec<usize>>,
    grouped: HashMap<(String, u64), StarGroups>,
}

impl StarCatalog {
    pub fn new(size_class_interval: f64) -> Self {
        Self {
            stars: Vec::new(),
            size_class_interval: if size_class_interval > 0.0 {
                size_class_interval
            } else {
                DEFAULT_SIZE_CLASS_INTERVAL
            },
            sorted: HashMap::new(),
            grouped: HashMap::new(),
        }
    }

    /// Replace the catalog content with `raw`, assigning ids `s1..sN`.
    ///
    /// With a `target_area`, stars whose centroid lies outside it are
    /// dropped before ids are assigned.
    pub fn populate(&mut self, raw: &[RawStar], target_area: Option<&Rect>) {
        let interval = self.size_class_interval;
        self.stars = raw
            .iter()
            .filter(|r| target_area.map_or(true, |area| area.includes(r.pos.x, r.pos.y)))
            .enumerate()
            .map(|(i, r)| Star::new(i + 1, r, interval))
            .collect();
        self.clear_cache();
        tracing::debug!("Catalog populated with {} stars", self.stars.len());
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    pub fn stars(&self) -> &[Star] {
        &self.stars
    }

    pub fn get(&self, index: usize) -> Option<&Star> {
        self.stars.get(index)
    }

    /// Mutable access to one star. Sort/group caches are NOT invalidated;
    /// call `clear_cache` after changing features used in an index.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Star> {
        self.stars.get_mut(index)
    }

    pub fn find(&self, id: &str) -> Option<usize> {
        self.stars.iter().position(|s| s.id() == id)
    }

    pub fn size_class_interval(&self) -> f64 {
        self.size_class_interval
    }

    /// Numeric values of `feature` for every star that has it
    pub fn values(&self, feature: &str) -> Vec<f64> {
        self.stars.iter().filter_map(|s| s.feature(feature)).collect()
    }

    /// Indexes of the stars having `feature`, ascending by its value.
    ///
    /// Stable: ties keep catalog order. Cached per feature string.
    pub fn sort_by(&mut self, feature: &str) -> &[usize] {
        if !self.sorted.contains_key(feature) {
            let mut keyed: Vec<(usize, f64)> = self
                .stars
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.feature(feature).map(|v| (i, v)))
                .collect();
            keyed.sort_by(|a, b| a.1.total_cmp(&b.1));
            self.sorted
                .insert(feature.to_string(), keyed.into_iter().map(|(i, _)| i).collect());
        }
        self.sorted.get(feature).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sorted stars by `feature` (see `sort_by`)
    pub fn sorted_stars(&mut self, feature: &str) -> Vec<&Star> {
        let order = self.sort_by(feature).to_vec();
        order.into_iter().map(|i| &self.stars[i]).collect()
    }

    /// Bucket the stars having `feature`, built from the sorted index.
    /// Cached per `(feature, interval)`.
    pub fn group_by(&mut self, feature: &str, interval: f64) -> &StarGroups {
        let interval = if interval > 0.0 {
            interval
        } else {
            DEFAULT_GROUP_INTERVAL
        };
        let key = (feature.to_string(), interval.to_bits());
        if !self.grouped.contains_key(&key) {
            let order = self.sort_by(feature).to_vec();
            let mut buckets: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
            for i in order {
                if let Some(v) = self.stars[i].feature(feature) {
                    buckets
                        .entry((v / interval).round() as i64)
                        .or_default()
                        .push(i);
                }
            }
            self.grouped
                .insert(key.clone(), StarGroups { interval, buckets });
        }
        &self.grouped[&key]
    }

    /// Drop every sort and group index
    pub fn clear_cache(&mut self) {
        self.sorted.clear();
        self.grouped.clear();
    }

    /// Star indexes per size class, ascending
    pub fn size_classes(&self) -> BTreeMap<i64, Vec<usize>> {
        let mut classes: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (i, s) in self.stars.iter().enumerate() {
            classes
                .entry(s.size_class().round() as i64)
                .or_default()
                .push(i);
        }
        classes
    }

    /// Largest size class plus one interval; 0 for an empty catalog
    pub fn max_class(&self) -> f64 {
        self.stars
            .iter()
            .map(Star::size_class)
            .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))))
            .map_or(0.0, |m| m + self.size_class_interval)
    }
}
