use objloader_types::BaseId;

/// Why an id will never be released.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeferError {
    /// The remote service completed a request without this id.
    #[error("object not found: {0}")]
    NotFound(BaseId),

    /// The request carrying this id failed.
    #[error("object {id} unavailable: {reason}")]
    Unavailable { id: BaseId, reason: String },

    /// The dependency graph around this id did not drain.
    #[error("cycle or missing dependency at {id}: {reason}")]
    CycleOrMissingDependency { id: BaseId, reason: String },

    /// A transitive dependency of `id` failed. `chain` runs from the
    /// missing id up to `id`.
    #[error("{id} depends on {missing}, which failed ({reason}); chain: {}", format_chain(.chain))]
    MissingDependency {
        id: BaseId,
        missing: BaseId,
        chain: Vec<BaseId>,
        reason: String,
    },
}

impl DeferError {
    /// The id this error is about.
    pub fn id(&self) -> &BaseId {
        match self {
            Self::NotFound(id) => id,
            Self::Unavailable { id, .. } => id,
            Self::CycleOrMissingDependency { id, .. } => id,
            Self::MissingDependency { id, .. } => id,
        }
    }

    /// The failure of `parent`, which was waiting on the id of `self`.
    pub fn propagate_to(&self, parent: &BaseId) -> DeferError {
        match self {
            Self::MissingDependency {
                missing,
                chain,
                reason,
                ..
            } => {
                let mut chain = chain.clone();
                chain.push(parent.clone());
                Self::MissingDependency {
                    id: parent.clone(),
                    missing: missing.clone(),
                    chain,
                    reason: reason.clone(),
                }
            }
            other => Self::MissingDependency {
                id: parent.clone(),
                missing: other.id().clone(),
                chain: vec![other.id().clone(), parent.clone()],
                reason: other.to_string(),
            },
        }
    }
}

fn format_chain(chain: &[BaseId]) -> String {
    chain
        .iter()
        .map(BaseId::short)
        .collect::<Vec<_>>()
        .join(" <- ")
}

pub type DeferResult<T> = Result<T, DeferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagation_extends_chain() {
        let c = BaseId::new("c");
        let b = BaseId::new("b");
        let p = BaseId::new("p");
        let at_b = DeferError::NotFound(c.clone()).propagate_to(&b);
        let at_p = at_b.propagate_to(&p);
        match &at_p {
            DeferError::MissingDependency {
                id, missing, chain, ..
            } => {
                assert_eq!(id, &p);
                assert_eq!(missing, &c);
                assert_eq!(chain, &vec![c.clone(), b.clone(), p.clone()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(at_p.id(), &p);
        assert!(at_p.to_string().contains("c <- b <- p"));
    }
}
