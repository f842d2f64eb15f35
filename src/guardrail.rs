use std::sync::Arc;

use crate::agent::Payload;

/// Outcome of one guardrail check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// A failing verdict carrying every reason the guardrail found.
    pub fn fail<I, E>(errors: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<String>,
    {
        Self {
            valid: false,
            errors: errors.into_iter().map(Into::into).collect(),
        }
    }

    /// Pass when `errors` is empty, fail with them otherwise.
    pub fn from_errors(errors: Vec<String>) -> Self {
        if errors.is_empty() {
            Self::pass()
        } else {
            Self {
                valid: false,
                errors,
            }
        }
    }
}

/// A named, stateless validation predicate.
///
/// Input guardrails see the stage input only (`output` is `None`). Output
/// guardrails see the original input plus what the behavior produced.
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, input: &Payload, output: Option<&Payload>) -> Verdict;
}

/// Guardrail backed by a plain function or closure.
pub struct FnGuardrail<F> {
    name: String,
    check: F,
}

impl<F> Guardrail for FnGuardrail<F>
where
    F: Fn(&Payload, Option<&Payload>) -> Verdict + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, input: &Payload, output: Option<&Payload>) -> Verdict {
        (self.check)(input, output)
    }
}

/// Build a guardrail from a closure.
pub fn guardrail<F>(name: impl Into<String>, check: F) -> FnGuardrail<F>
where
    F: Fn(&Payload, Option<&Payload>) -> Verdict + Send + Sync,
{
    FnGuardrail {
        name: name.into(),
        check,
    }
}

/// Run guardrails in declaration order, stopping at the first rejection.
///
/// Returns the failing guardrail's name and its full error list.
pub(crate) fn first_failure(
    guardrails: &[Arc<dyn Guardrail>],
    input: &Payload,
    output: Option<&Payload>,
) -> Option<(String, Vec<String>)> {
    for g in guardrails {
        let verdict = g.validate(input, output);
        if !verdict.valid {
            return Some((g.name().to_string(), verdict.errors));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn from_errors_passes_when_empty() {
        assert!(Verdict::from_errors(Vec::new()).valid);
        let v = Verdict::from_errors(vec!["x".into()]);
        assert!(!v.valid);
        assert_eq!(v.errors, vec!["x".to_string()]);
    }

    #[test]
    fn first_failure_short_circuits_in_declaration_order() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&later_calls);

        let ok = guardrail("ok", |_, _| Verdict::pass());
        let bad = guardrail("bad", |_, _| Verdict::fail(["first", "second"]));
        let never = guardrail("never", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Verdict::fail(["unreachable"])
        });

        let list: Vec<Arc<dyn Guardrail>> = vec![Arc::new(ok), Arc::new(bad), Arc::new(never)];
        let failure = first_failure(&list, &Payload::new(), None);

        assert_eq!(
            failure,
            Some(("bad".to_string(), vec!["first".to_string(), "second".to_string()]))
        );
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn output_guardrail_sees_both_payloads() {
        let g = guardrail("echo", |input, output| {
            let same = output.map(|o| o == input).unwrap_or(false);
            if same {
                Verdict::pass()
            } else {
                Verdict::fail(["differs"])
            }
        });
        let p = Payload::new();
        assert!(g.validate(&p, Some(&p)).valid);
        assert!(!g.validate(&p, None).valid);
    }
}
