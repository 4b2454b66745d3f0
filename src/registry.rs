//! Stub mapping registry.
//!
//! Mappings live in an arena of slots addressed by position. An index keyed
//! by method and first path segment narrows the candidates for a request
//! before predicates are evaluated.

use crate::config::{RequestPattern, ResponseDefinition, StubDefinition};
use crate::error::StubError;
use crate::journal::LoggedRequest;
use crate::matcher::{request_segment, CompiledPattern, MatchContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifier assigned to a mapping at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingId(pub u64);

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered stub mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StubMapping {
    pub id: MappingId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub request: RequestPattern,
    pub response: ResponseDefinition,
    pub priority: i32,
}

impl fmt::Display for StubMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string_pretty(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "StubMapping {}", self.id),
        }
    }
}

/// Result of matching a request against the registry.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// The selected mapping
    pub mapping: Arc<StubMapping>,
    /// Context captured during matching
    pub context: MatchContext,
}

/// A mapping that almost matched an unmatched request.
#[derive(Debug, Clone)]
pub struct NearMiss {
    pub mapping: Arc<StubMapping>,
    /// Descriptions of the predicates the request failed
    pub failures: Vec<String>,
    /// Summed weight of the failed predicates; lower is closer
    pub distance: u32,
}

struct Slot {
    mapping: Arc<StubMapping>,
    pattern: CompiledPattern,
    /// Registration order, later wins ties
    sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    method: Option<String>,
    segment: Option<String>,
}

/// Arena of stub mappings plus the candidate index.
#[derive(Default)]
pub struct StubRegistry {
    slots: Vec<Option<Slot>>,
    index: HashMap<IndexKey, Vec<usize>>,
    next_id: u64,
    sequence: u64,
}

impl StubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, compile and store a stub definition.
    pub fn insert(&mut self, definition: StubDefinition) -> Result<Arc<StubMapping>, StubError> {
        definition.validate()?;
        let pattern = CompiledPattern::compile(&definition.request)?;

        self.next_id += 1;
        self.sequence += 1;
        let mapping = Arc::new(StubMapping {
            id: MappingId(self.next_id),
            name: definition.name,
            request: definition.request,
            response: definition.response,
            priority: definition.priority,
        });

        let position = self.slots.len();
        let segment = pattern.index_segment().map(str::to_string);
        let methods: Vec<Option<String>> = if pattern.methods().is_empty() {
            vec![None]
        } else {
            pattern.methods().iter().cloned().map(Some).collect()
        };
        for method in methods {
            self.index
                .entry(IndexKey {
                    method,
                    segment: segment.clone(),
                })
                .or_default()
                .push(position);
        }

        self.slots.push(Some(Slot {
            mapping: Arc::clone(&mapping),
            pattern,
            sequence: self.sequence,
        }));

        Ok(mapping)
    }

    /// Remove a mapping by id.
    pub fn remove(&mut self, id: MappingId) -> Option<Arc<StubMapping>> {
        let position = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(s) if s.mapping.id == id))?;
        let slot = self.slots[position].take()?;

        self.index.retain(|_, positions| {
            positions.retain(|p| *p != position);
            !positions.is_empty()
        });

        Some(slot.mapping)
    }

    /// Drop every mapping. Ids keep increasing across clears.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mappings in registration order.
    pub fn mappings(&self) -> Vec<Arc<StubMapping>> {
        self.live().map(|s| Arc::clone(&s.mapping)).collect()
    }

    /// Most recently registered mapping with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<StubMapping>> {
        self.live()
            .filter(|s| s.mapping.name.as_deref() == Some(name))
            .last()
            .map(|s| Arc::clone(&s.mapping))
    }

    /// Select the best mapping for a request.
    ///
    /// Ranking is priority, then specificity, then registration order with
    /// the latest registration winning.
    pub fn find_match(&self, request: &LoggedRequest) -> Option<MatchResult> {
        let mut best: Option<(&Slot, MatchContext)> = None;

        for position in self.candidates(request) {
            let Some(slot) = self.slots.get(position).and_then(Option::as_ref) else {
                continue;
            };
            let Ok(context) = slot.pattern.evaluate(request) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => rank(slot) > rank(current),
            };
            if better {
                best = Some((slot, context));
            }
        }

        best.map(|(slot, context)| MatchResult {
            mapping: Arc::clone(&slot.mapping),
            context,
        })
    }

    /// Mappings closest to matching a request. A failed URL rule costs more
    /// than a failed method, so distance is the weight of what failed.
    pub fn near_misses(&self, request: &LoggedRequest, limit: usize) -> Vec<NearMiss> {
        let mut misses: Vec<(u64, NearMiss)> = self
            .live()
            .filter_map(|slot| {
                slot.pattern.evaluate(request).err().map(|mismatch| {
                    (
                        slot.sequence,
                        NearMiss {
                            mapping: Arc::clone(&slot.mapping),
                            failures: mismatch.failures,
                            distance: mismatch.distance,
                        },
                    )
                })
            })
            .collect();

        misses.sort_by(|(seq_a, a), (seq_b, b)| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.failures.len().cmp(&b.failures.len()))
                .then_with(|| seq_b.cmp(seq_a))
        });
        misses.into_iter().take(limit).map(|(_, miss)| miss).collect()
    }

    fn live(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().flatten()
    }

    /// Positions of the slots that could match a request.
    fn candidates(&self, request: &LoggedRequest) -> Vec<usize> {
        let method = Some(request.method.clone());
        let segment = Some(request_segment(&request.path).to_string());

        let keys = [
            IndexKey {
                method: method.clone(),
                segment: segment.clone(),
            },
            IndexKey {
                method: method.clone(),
                segment: None,
            },
            IndexKey {
                method: None,
                segment: segment.clone(),
            },
            IndexKey {
                method: None,
                segment: None,
            },
        ];

        let mut positions: Vec<usize> = keys
            .iter()
            .filter_map(|key| self.index.get(key))
            .flatten()
            .copied()
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions
    }
}

fn rank(slot: &Slot) -> (i32, u32, u64) {
    (
        slot.mapping.priority,
        slot.pattern.specificity(),
        slot.sequence,
    )
}
