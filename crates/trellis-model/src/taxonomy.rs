//! Concept and relation taxonomy.
//!
//! The taxonomy is the controlled vocabulary query terms are validated and
//! expanded against. Concept types form a multiple-inheritance "is-a"
//! hierarchy; relation types are a flat lookup table kept separate from the
//! concept table. Lookup is case- and synonym-insensitive: synonyms map to
//! canonical names before the arena lookup.
//!
//! Ancestor traversal is a breadth-first walk over an explicit parent-edge
//! index with a visited set, so diamond inheritance never revisits a type
//! and malformed (cyclic) data never loops.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Name;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaxonomyError {
    #[error("unknown concept type: {0}")]
    UnknownConcept(Name),
    #[error("unknown relation type: {0}")]
    UnknownRelation(Name),
    #[error("duplicate concept type: {0}")]
    DuplicateConcept(Name),
    #[error("duplicate relation type: {0}")]
    DuplicateRelation(Name),
    #[error("concept type {concept} names unknown parent {parent}")]
    UnresolvedParent { concept: Name, parent: Name },
}

/// A semantic category of entities, e.g. `chemical_substance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptType {
    pub name: Name,
    /// Parent concept names; multiple inheritance is allowed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub parents: BTreeSet<Name>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub synonyms: BTreeSet<Name>,
}

impl ConceptType {
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            parents: BTreeSet::new(),
            synonyms: BTreeSet::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<Name>) -> Self {
        self.parents.insert(parent.into());
        self
    }

    pub fn with_synonym(mut self, synonym: impl Into<Name>) -> Self {
        self.synonyms.insert(synonym.into());
        self
    }
}

/// A predicate between concept types, e.g. `targets` or `treats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationType {
    pub name: Name,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub synonyms: BTreeSet<Name>,
}

impl RelationType {
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            synonyms: BTreeSet::new(),
        }
    }

    pub fn with_synonym(mut self, synonym: impl Into<Name>) -> Self {
        self.synonyms.insert(synonym.into());
        self
    }
}

/// Immutable vocabulary arena addressed by name.
///
/// Built once per process (or refresh cycle) and shared read-only by all
/// concurrent query executions.
#[derive(Debug, Default, Clone)]
pub struct ConceptTaxonomy {
    concepts: HashMap<Name, ConceptType>,
    relations: HashMap<Name, RelationType>,
    /// Lowercased canonical names and synonyms -> canonical concept name.
    concept_index: HashMap<String, Name>,
    /// Lowercased canonical names and synonyms -> canonical relation name.
    relation_index: HashMap<String, Name>,
}

impl ConceptTaxonomy {
    /// Build and validate a taxonomy.
    ///
    /// Canonical names must be unique within their table (case-insensitive)
    /// and every parent reference must resolve to a concept type or one of
    /// its synonyms.
    pub fn build(
        concepts: impl IntoIterator<Item = ConceptType>,
        relations: impl IntoIterator<Item = RelationType>,
    ) -> Result<Self, TaxonomyError> {
        let mut out = Self::default();

        // Canonical names claim their index slot first; synonyms never
        // shadow a canonical entry. A synonym claimed by two types goes to
        // the canonically-first one, so lookup stays deterministic.
        for concept in concepts {
            let key = concept.name.to_lowercase();
            if out.concept_index.contains_key(&key) {
                return Err(TaxonomyError::DuplicateConcept(concept.name));
            }
            out.concept_index.insert(key, concept.name.clone());
            out.concepts.insert(concept.name.clone(), concept);
        }
        let mut concepts_by_name: Vec<&ConceptType> = out.concepts.values().collect();
        concepts_by_name.sort_by(|a, b| a.name.cmp(&b.name));
        for concept in concepts_by_name {
            for synonym in &concept.synonyms {
                out.concept_index
                    .entry(synonym.to_lowercase())
                    .or_insert_with(|| concept.name.clone());
            }
        }

        for relation in relations {
            let key = relation.name.to_lowercase();
            if out.relation_index.contains_key(&key) {
                return Err(TaxonomyError::DuplicateRelation(relation.name));
            }
            out.relation_index.insert(key, relation.name.clone());
            out.relations.insert(relation.name.clone(), relation);
        }
        let mut relations_by_name: Vec<&RelationType> = out.relations.values().collect();
        relations_by_name.sort_by(|a, b| a.name.cmp(&b.name));
        for relation in relations_by_name {
            for synonym in &relation.synonyms {
                out.relation_index
                    .entry(synonym.to_lowercase())
                    .or_insert_with(|| relation.name.clone());
            }
        }

        for concept in out.concepts.values() {
            for parent in &concept.parents {
                if !out.concept_index.contains_key(&parent.to_lowercase()) {
                    return Err(TaxonomyError::UnresolvedParent {
                        concept: concept.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        Ok(out)
    }

    /// Resolve a name or synonym, case-insensitively, to its concept type.
    pub fn resolve(&self, name: &str) -> Result<&ConceptType, TaxonomyError> {
        self.concept_index
            .get(&name.to_lowercase())
            .and_then(|canonical| self.concepts.get(canonical))
            .ok_or_else(|| TaxonomyError::UnknownConcept(name.to_string()))
    }

    /// Resolve a name or synonym, case-insensitively, to its relation type.
    pub fn resolve_relation(&self, name: &str) -> Result<&RelationType, TaxonomyError> {
        self.relation_index
            .get(&name.to_lowercase())
            .and_then(|canonical| self.relations.get(canonical))
            .ok_or_else(|| TaxonomyError::UnknownRelation(name.to_string()))
    }

    /// Walk the proper ancestors of `name`, nearest first.
    ///
    /// The walk is lazy, finite, and restartable: each call starts a fresh
    /// traversal. A visited set guards against revisiting a type reachable
    /// through multiple inheritance paths.
    pub fn ancestors(&self, name: &str) -> Result<Ancestors<'_>, TaxonomyError> {
        let start = self.resolve(name)?;
        let mut visited = HashSet::new();
        visited.insert(start.name.clone());
        Ok(Ancestors {
            taxonomy: self,
            queue: start.parents.iter().cloned().collect(),
            visited,
        })
    }

    /// True when `ancestor` appears somewhere above `name` in the hierarchy.
    /// A type is not its own descendant.
    pub fn is_descendant_of(&self, name: &str, ancestor: &str) -> Result<bool, TaxonomyError> {
        let target = self.resolve(ancestor)?.name.clone();
        Ok(self.ancestors(name)?.any(|concept| concept.name == target))
    }

    /// All canonical concept names, sorted.
    pub fn concept_names(&self) -> Vec<Name> {
        let mut names: Vec<Name> = self.concepts.keys().cloned().collect();
        names.sort();
        names
    }

    /// All canonical relation names, sorted.
    pub fn relation_names(&self) -> Vec<Name> {
        let mut names: Vec<Name> = self.relations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn concept_count(&self) -> usize {
        self.concepts.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }
}

/// Breadth-first ancestor walk, nearest first. See
/// [`ConceptTaxonomy::ancestors`].
pub struct Ancestors<'a> {
    taxonomy: &'a ConceptTaxonomy,
    queue: VecDeque<Name>,
    visited: HashSet<Name>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a ConceptType;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(name) = self.queue.pop_front() {
            // Parent references may use synonyms; resolve them through the
            // index. Unresolvable names were rejected at build time, so a
            // miss here just ends that branch.
            let Some(concept) = self
                .taxonomy
                .concept_index
                .get(&name.to_lowercase())
                .and_then(|canonical| self.taxonomy.concepts.get(canonical))
            else {
                continue;
            };
            if !self.visited.insert(concept.name.clone()) {
                continue;
            }
            for parent in &concept.parents {
                if !self.visited.contains(parent) {
                    self.queue.push_back(parent.clone());
                }
            }
            return Some(concept);
        }
        None
    }
}
