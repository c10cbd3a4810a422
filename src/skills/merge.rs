//! Line-oriented three-way merge. Regions where only one side diverged from
//! the base take that side; identical divergence merges cleanly; competing
//! divergence emits conflict markers and sets the flag.

pub const CONFLICT_CURRENT: &str = "<<<<<<< current";
pub const CONFLICT_BASE: &str = "||||||| base";
pub const CONFLICT_SEPARATOR: &str = "=======";
pub const CONFLICT_SKILL: &str = ">>>>>>> skill";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub content: String,
    pub conflicts: bool,
}

pub fn merge_three_way(base: &str, current: &str, skill: &str) -> MergeOutcome {
    let base_lines: Vec<&str> = base.lines().collect();
    let current_lines: Vec<&str> = current.lines().collect();
    let skill_lines: Vec<&str> = skill.lines().collect();

    let base_to_current = lcs_pairs(&base_lines, &current_lines);
    let base_to_skill = lcs_pairs(&base_lines, &skill_lines);

    let mut current_match = vec![None; base_lines.len()];
    for (b, c) in base_to_current {
        current_match[b] = Some(c);
    }
    let mut skill_match = vec![None; base_lines.len()];
    for (b, s) in base_to_skill {
        skill_match[b] = Some(s);
    }

    let mut merged: Vec<String> = Vec::new();
    let mut conflicts = false;
    let (mut b, mut c, mut s) = (0usize, 0usize, 0usize);

    let mut stable = b;
    loop {
        // Next base line matched by both sides at or after the cursor.
        while stable < base_lines.len()
            && !(matches!(current_match[stable], Some(cc) if cc >= c)
                && matches!(skill_match[stable], Some(ss) if ss >= s))
        {
            stable += 1;
        }

        let (chunk_c_end, chunk_s_end) = if stable < base_lines.len() {
            (
                current_match[stable].unwrap_or(current_lines.len()),
                skill_match[stable].unwrap_or(skill_lines.len()),
            )
        } else {
            (current_lines.len(), skill_lines.len())
        };

        if b < stable || c < chunk_c_end || s < chunk_s_end {
            let base_chunk = &base_lines[b..stable];
            let current_chunk = &current_lines[c..chunk_c_end];
            let skill_chunk = &skill_lines[s..chunk_s_end];
            resolve_chunk(
                base_chunk,
                current_chunk,
                skill_chunk,
                &mut merged,
                &mut conflicts,
            );
        }

        if stable >= base_lines.len() {
            break;
        }

        merged.push(base_lines[stable].to_string());
        b = stable + 1;
        c = chunk_c_end + 1;
        s = chunk_s_end + 1;
        stable = b;
    }

    let mut content = merged.join("\n");
    if !content.is_empty() && (ends_with_newline(current) || ends_with_newline(skill)) {
        content.push('\n');
    }
    MergeOutcome { content, conflicts }
}

fn resolve_chunk(
    base: &[&str],
    current: &[&str],
    skill: &[&str],
    merged: &mut Vec<String>,
    conflicts: &mut bool,
) {
    if current == base {
        merged.extend(skill.iter().map(|line| line.to_string()));
    } else if skill == base || current == skill {
        merged.extend(current.iter().map(|line| line.to_string()));
    } else {
        *conflicts = true;
        merged.push(CONFLICT_CURRENT.to_string());
        merged.extend(current.iter().map(|line| line.to_string()));
        merged.push(CONFLICT_BASE.to_string());
        merged.extend(base.iter().map(|line| line.to_string()));
        merged.push(CONFLICT_SEPARATOR.to_string());
        merged.extend(skill.iter().map(|line| line.to_string()));
        merged.push(CONFLICT_SKILL.to_string());
    }
}

/// Longest common subsequence as monotonic index pairs.
fn lcs_pairs(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let rows = a.len();
    let cols = b.len();
    let mut table = vec![0u32; (rows + 1) * (cols + 1)];
    let at = |i: usize, j: usize| i * (cols + 1) + j;

    for i in (0..rows).rev() {
        for j in (0..cols).rev() {
            table[at(i, j)] = if a[i] == b[j] {
                table[at(i + 1, j + 1)] + 1
            } else {
                table[at(i + 1, j)].max(table[at(i, j + 1)])
            };
        }
    }

    let mut pairs = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < rows && j < cols {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[at(i + 1, j)] >= table[at(i, j + 1)] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

fn ends_with_newline(text: &str) -> bool {
    text.ends_with('\n')
}
