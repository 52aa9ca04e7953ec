use proccore::{Context, ProcError, ProcessDefinition, StepKind};

/// Next step set computed after a step completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextSteps {
    /// The step has no outgoing transitions
    Terminal,
    Single(usize),
    /// Branch start steps of a split, in declared order
    Fork(Vec<usize>),
}

/// Evaluate every outgoing transition of `current` in declared order.
///
/// A split fires all matching transitions. Any other step must match
/// exactly one: several matches is an ambiguity error, never a
/// first-match pick, and zero matches is `NoViableTransition`.
pub fn resolve(
    definition: &ProcessDefinition,
    current: usize,
    context: &Context,
) -> Result<NextSteps, ProcError> {
    if definition.is_terminal(current) {
        return Ok(NextSteps::Terminal);
    }

    let step = definition.step(current);
    let matched: Vec<usize> = definition
        .transitions_from(current)
        .filter(|t| t.condition.evaluate(context))
        .map(|t| t.to)
        .collect();

    match (step.kind, matched.len()) {
        (_, 0) => Err(ProcError::NoViableTransition {
            step: step.id.clone(),
        }),
        (StepKind::Split, _) => Ok(NextSteps::Fork(matched)),
        (_, 1) => Ok(NextSteps::Single(matched[0])),
        _ => Err(ProcError::AmbiguousTransition {
            step: step.id.clone(),
            targets: matched
                .into_iter()
                .map(|i| definition.step(i).id.clone())
                .collect(),
        }),
    }
}
