use crate::error::{Result, RpqError};
use crate::{Label, State};
use rustc_hash::{FxHashMap, FxHashSet};

/// The state every path starts in.
pub const INITIAL_STATE: State = 0;

/// A single `from --label--> to` move of the automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub label: Label,
}

impl Transition {
    pub fn new(from: State, to: State, label: Label) -> Self {
        Self { from, to, label }
    }
}

/// Deterministic finite automaton over edge labels.
///
/// Built once per query and never mutated afterwards; the engine shares it
/// behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Automaton {
    /// state -> (label, destination)
    outgoing: FxHashMap<State, Vec<(Label, State)>>,
    /// label -> every (source, destination) pair firable on it
    by_label: FxHashMap<Label, Vec<(State, State)>>,
    final_states: FxHashSet<State>,
    acceptable_labels: FxHashSet<Label>,
    state_count: usize,
}

impl Automaton {
    pub fn new(transitions: &[Transition], final_states: &[State]) -> Result<Self> {
        let mut outgoing: FxHashMap<State, Vec<(Label, State)>> = FxHashMap::default();
        let mut by_label: FxHashMap<Label, Vec<(State, State)>> = FxHashMap::default();
        let mut acceptable_labels = FxHashSet::default();
        let mut states: FxHashSet<State> = FxHashSet::default();
        states.insert(INITIAL_STATE);

        for t in transitions {
            let succ = outgoing.entry(t.from).or_default();
            if let Some(&(_, existing)) = succ.iter().find(|(l, _)| *l == t.label) {
                if existing != t.to {
                    return Err(RpqError::NondeterministicTransition {
                        state: t.from,
                        label: t.label,
                        first: existing,
                        second: t.to,
                    });
                }
                continue;
            }
            succ.push((t.label, t.to));
            by_label.entry(t.label).or_default().push((t.from, t.to));
            acceptable_labels.insert(t.label);
            states.insert(t.from);
            states.insert(t.to);
        }
        states.extend(final_states.iter().copied());

        Ok(Self {
            outgoing,
            by_label,
            final_states: final_states.iter().copied().collect(),
            acceptable_labels,
            state_count: states.len(),
        })
    }

    /// Builds one of the canned benchmark queries, binding its letters to
    /// `labels` in order.
    pub fn from_query_type(query_type: u32, labels: &[Label]) -> Result<Self> {
        let needed = match query_type {
            1 => 1,
            2 | 3 | 8 => 2,
            4..=6 | 9 | 10 => 3,
            7 | 11 => 4,
            _ => return Err(RpqError::UnknownQueryType(query_type)),
        };
        if labels.len() < needed {
            return Err(RpqError::MissingLabels {
                query_type,
                expected: needed,
                got: labels.len(),
            });
        }
        let l = |i: usize| labels[i];
        let t = Transition::new;

        let (transitions, finals): (Vec<Transition>, Vec<State>) = match query_type {
            // a*
            1 => (vec![t(0, 0, l(0))], vec![0]),
            // (a|b)b*
            2 => (vec![t(0, 1, l(0)), t(0, 1, l(1)), t(1, 1, l(1))], vec![1]),
            // ab*
            3 => (vec![t(0, 1, l(0)), t(1, 1, l(1))], vec![1]),
            // abc
            4 => (vec![t(0, 1, l(0)), t(1, 2, l(1)), t(2, 3, l(2))], vec![3]),
            // abc*
            5 => (vec![t(0, 1, l(0)), t(1, 2, l(1)), t(2, 2, l(2))], vec![2]),
            // ab*c
            6 => (vec![t(0, 1, l(0)), t(1, 1, l(1)), t(1, 2, l(2))], vec![2]),
            // (a|b|c)d*
            7 => (
                vec![t(0, 1, l(0)), t(0, 1, l(1)), t(0, 1, l(2)), t(1, 1, l(3))],
                vec![1],
            ),
            // a*b*
            8 => (vec![t(0, 0, l(0)), t(0, 1, l(1)), t(1, 1, l(1))], vec![0, 1]),
            // ab*c*
            9 => (
                vec![t(0, 1, l(0)), t(1, 1, l(1)), t(1, 2, l(2)), t(2, 2, l(2))],
                vec![1, 2],
            ),
            // (a|b|c)*
            10 => (vec![t(0, 0, l(0)), t(0, 0, l(1)), t(0, 0, l(2))], vec![0]),
            // abcd
            11 => (
                vec![t(0, 1, l(0)), t(1, 2, l(1)), t(2, 3, l(2)), t(3, 4, l(3))],
                vec![4],
            ),
            _ => unreachable!("query type validated above"),
        };

        Self::new(&transitions, &finals)
    }

    /// Human readable shape of a canned query, used in logs.
    pub fn describe_query_type(query_type: u32) -> &'static str {
        match query_type {
            1 => "a*",
            2 => "(a|b)b*",
            3 => "ab*",
            4 => "abc",
            5 => "abc*",
            6 => "ab*c",
            7 => "(a|b|c)d*",
            8 => "a*b*",
            9 => "ab*c*",
            10 => "(a|b|c)*",
            11 => "abcd",
            _ => "unknown",
        }
    }

    /// Every `(sb, sd)` with `delta(sb, label) = sd`.
    pub fn transitions_on(&self, label: Label) -> &[(State, State)] {
        self.by_label.get(&label).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn next_state(&self, state: State, label: Label) -> Option<State> {
        self.outgoing
            .get(&state)?
            .iter()
            .find(|(l, _)| *l == label)
            .map(|&(_, to)| to)
    }

    pub fn successors(&self, state: State) -> impl Iterator<Item = (Label, State)> + '_ {
        self.outgoing.get(&state).into_iter().flatten().copied()
    }

    pub fn is_final(&self, state: State) -> bool {
        self.final_states.contains(&state)
    }

    pub fn final_states(&self) -> impl Iterator<Item = State> + '_ {
        self.final_states.iter().copied()
    }

    /// O(1) rejection test for edges the query can never use.
    pub fn accepts_label(&self, label: Label) -> bool {
        self.acceptable_labels.contains(&label)
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }
}
