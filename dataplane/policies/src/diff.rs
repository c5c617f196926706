use npm_dataplane_core::{Rule, RuleEdit};

/// Computes an edit script transforming `installed` into `staged`.
///
/// Common leading and trailing rules are kept as-is; the remainder is aligned on its longest
/// common subsequence so that only changed rules are deleted or inserted.
pub fn rule_edits(installed: &[Rule], staged: &[Rule]) -> Vec<RuleEdit> {
    let prefix = installed
        .iter()
        .zip(staged)
        .take_while(|(a, b)| a == b)
        .count();
    let (installed_rest, staged_rest) = (&installed[prefix..], &staged[prefix..]);
    let suffix = installed_rest
        .iter()
        .rev()
        .zip(staged_rest.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old = &installed_rest[..installed_rest.len() - suffix];
    let new = &staged_rest[..staged_rest.len() - suffix];

    // lcs[i][j] holds the length of the longest common subsequence of old[i..] and new[j..].
    let mut lcs = vec![vec![0usize; new.len() + 1]; old.len() + 1];
    for i in (0..old.len()).rev() {
        for j in (0..new.len()).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut edits = Edits::default();
    edits.keep(prefix);
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        if old[i] == new[j] {
            edits.keep(1);
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            edits.push(RuleEdit::Delete {
                rule: old[i].clone(),
            });
            i += 1;
        } else {
            edits.push(RuleEdit::Insert {
                rule: new[j].clone(),
            });
            j += 1;
        }
    }
    for rule in &old[i..] {
        edits.push(RuleEdit::Delete { rule: rule.clone() });
    }
    for rule in &new[j..] {
        edits.push(RuleEdit::Insert { rule: rule.clone() });
    }
    edits.keep(suffix);
    edits.0
}

/// Applies an edit script to an installed rule sequence.
///
/// Returns `None` if the script does not match the installed rules.
pub fn apply_edits(installed: &[Rule], edits: &[RuleEdit]) -> Option<Vec<Rule>> {
    let mut rules = Vec::with_capacity(installed.len());
    let mut cursor = 0;
    for edit in edits {
        match edit {
            RuleEdit::Keep { count } => {
                rules.extend_from_slice(installed.get(cursor..cursor + count)?);
                cursor += count;
            }
            RuleEdit::Delete { rule } => {
                if installed.get(cursor) != Some(rule) {
                    return None;
                }
                cursor += 1;
            }
            RuleEdit::Insert { rule } => rules.push(rule.clone()),
        }
    }
    if cursor != installed.len() {
        return None;
    }
    Some(rules)
}

#[derive(Default)]
struct Edits(Vec<RuleEdit>);

impl Edits {
    fn keep(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(RuleEdit::Keep { count }) = self.0.last_mut() {
            *count += n;
        } else {
            self.0.push(RuleEdit::Keep { count: n });
        }
    }

    fn push(&mut self, edit: RuleEdit) {
        self.0.push(edit);
    }
}
