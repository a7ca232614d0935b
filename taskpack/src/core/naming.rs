//! Deterministic branch, worktree and run-directory names.

/// Lowercase ASCII slug: runs of non-alphanumerics become a single `-`.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.len() > max_len {
        slug.truncate(max_len);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    slug
}

/// `tp/<id>-<slug>` for a packet, e.g. `tp/tp_0001-add-parser`.
pub fn packet_branch(packet_id: &str, title: &str) -> String {
    let slug = slugify(title, 40);
    let id = packet_id.to_ascii_lowercase();
    if slug.is_empty() {
        format!("tp/{id}")
    } else {
        format!("tp/{id}-{slug}")
    }
}

/// `tp/<run dir name>` when the packet is unknown.
pub fn run_branch(run_name: &str) -> String {
    let slug = slugify(run_name, 60);
    if slug.is_empty() {
        "tp/run".to_string()
    } else {
        format!("tp/{slug}")
    }
}

/// Directory name for a branch's worktree: `/` becomes `__`.
pub fn worktree_dir_name(branch: &str) -> String {
    branch.replace('/', "__")
}

/// Deterministic stash message: `taskpack:<operation>:<run name>`.
pub fn stash_message(operation: &str, run_name: &str) -> String {
    format!("taskpack:{operation}:{run_name}")
}
