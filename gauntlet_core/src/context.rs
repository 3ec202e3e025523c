use crate::instruction::MethodKey;
use crate::mutator::MethodMutator;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable key of one candidate mutation.
///
/// Two discovery passes over the same unchanged class produce identical
/// identifiers in identical order, so an identifier found during discovery can
/// later select exactly that candidate in a build pass.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationIdentifier {
    /// Globally unique id of the mutator that produced the candidate.
    pub mutator: String,
    pub class: String,
    pub method: MethodKey,
    /// Index of the matched instruction in the unmutated stream.
    pub index: usize,
    pub description: String,
}

impl MutationIdentifier {
    /// Hex md5 digest of every identifying field. Used as a short, reproducible
    /// key for reports.
    pub fn stable_hash(&self) -> String {
        let key = format!(
            "{}|{}|{}|{}|{}",
            self.mutator, self.class, self.method, self.index, self.description
        );
        format!("{:x}", md5::compute(key.as_bytes()))
    }
}

impl fmt::Display for MutationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{} @{} [{}] {}",
            self.class, self.method, self.index, self.mutator, self.description
        )
    }
}

/// Pass-scoped mutation state.
///
/// A context is created for exactly one pass: either discovery, where nothing
/// is ever applied, or the build of a single mutant, where only the target
/// identifier is applied. It is passed explicitly to every mutator call and is
/// never shared between passes.
#[derive(Debug, Clone)]
pub struct MutationContext {
    target: Option<MutationIdentifier>,
    class: String,
    method: MethodKey,
    index: usize,
    found: Vec<MutationIdentifier>,
}

impl MutationContext {
    /// Context for enumerating every candidate without applying any.
    pub fn discovery() -> Self {
        Self {
            target: None,
            class: String::new(),
            method: MethodKey::new("", ""),
            index: 0,
            found: Vec::new(),
        }
    }

    /// Context for building the single mutant identified by `target`.
    pub fn targeting(target: MutationIdentifier) -> Self {
        Self {
            target: Some(target),
            ..Self::discovery()
        }
    }

    pub fn target(&self) -> Option<&MutationIdentifier> {
        self.target.as_ref()
    }

    pub fn set_location(&mut self, class: &str, method: MethodKey) {
        self.class = class.to_string();
        self.method = method;
        self.index = 0;
    }

    pub fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// Records a candidate at the current location and returns its identifier.
    /// Registering the same tuple twice in one pass returns the existing
    /// identifier instead of a duplicate.
    pub fn register_mutation(
        &mut self,
        mutator: &dyn MethodMutator,
        description: &str,
    ) -> MutationIdentifier {
        let id = MutationIdentifier {
            mutator: mutator.globally_unique_id().to_string(),
            class: self.class.clone(),
            method: self.method.clone(),
            index: self.index,
            description: description.to_string(),
        };
        if !self.found.contains(&id) {
            self.found.push(id.clone());
        }
        id
    }

    pub fn should_mutate(&self, id: &MutationIdentifier) -> bool {
        self.target.as_ref() == Some(id)
    }

    pub fn found(&self) -> &[MutationIdentifier] {
        &self.found
    }

    pub fn into_found(self) -> Vec<MutationIdentifier> {
        self.found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::MathMutator;

    #[test]
    fn discovery_never_authorizes() {
        let mut ctx = MutationContext::discovery();
        ctx.set_location("demo/A", MethodKey::new("f", "()V"));
        ctx.set_index(3);
        let id = ctx.register_mutation(&MathMutator, "Replaced integer addition");
        assert!(!ctx.should_mutate(&id));
        assert_eq!(ctx.found(), &[id]);
    }

    #[test]
    fn targeting_authorizes_only_its_identifier() {
        let mut discovery = MutationContext::discovery();
        discovery.set_location("demo/A", MethodKey::new("f", "()V"));
        discovery.set_index(1);
        let first = discovery.register_mutation(&MathMutator, "a");
        discovery.set_index(2);
        let second = discovery.register_mutation(&MathMutator, "a");

        let mut build = MutationContext::targeting(second.clone());
        build.set_location("demo/A", MethodKey::new("f", "()V"));
        build.set_index(1);
        let again_first = build.register_mutation(&MathMutator, "a");
        build.set_index(2);
        let again_second = build.register_mutation(&MathMutator, "a");

        assert_eq!(first, again_first);
        assert!(!build.should_mutate(&again_first));
        assert!(build.should_mutate(&again_second));
    }

    #[test]
    fn registering_same_tuple_reuses_identifier() {
        let mut ctx = MutationContext::discovery();
        ctx.set_location("demo/A", MethodKey::new("f", "()V"));
        let a = ctx.register_mutation(&MathMutator, "same");
        let b = ctx.register_mutation(&MathMutator, "same");
        let c = ctx.register_mutation(&MathMutator, "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ctx.found().len(), 2);
    }

    #[test]
    fn stable_hash_depends_on_every_field() {
        let mut ctx = MutationContext::discovery();
        ctx.set_location("demo/A", MethodKey::new("f", "()V"));
        let a = ctx.register_mutation(&MathMutator, "x");
        ctx.set_index(1);
        let b = ctx.register_mutation(&MathMutator, "x");
        assert_eq!(a.stable_hash(), a.clone().stable_hash());
        assert_ne!(a.stable_hash(), b.stable_hash());
        assert_eq!(a.stable_hash().len(), 32);
    }
}
