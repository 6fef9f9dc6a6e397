//! Branch naming for tasks.
//!
//! Branch names follow `task-{slug(title)}-{shortid}` and are assigned once,
//! on the first transition into `PLANNING`. The short id suffix keeps
//! branches unique when two tasks share a title.

use uuid::Uuid;

/// Maximum length of the slug portion of a branch name.
const MAX_SLUG_LEN: usize = 40;

/// Length of the short id suffix taken from the task id.
const SHORT_ID_LEN: usize = 8;

/// Reduce a task title to a git-safe lowercase slug.
///
/// Non-alphanumeric runs collapse into single hyphens; leading/trailing
/// hyphens are trimmed and the result is truncated to a fixed length.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_hyphen = true;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(MAX_SLUG_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }

    slug
}

/// Build the stable branch name for a task.
pub fn branch_name_for_task(title: &str, task_id: Uuid) -> String {
    let slug = slugify(title);
    let short = &task_id.simple().to_string()[..SHORT_ID_LEN];
    if slug.is_empty() {
        format!("task-{short}")
    } else {
        format!("task-{slug}-{short}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Add code tab"), "add-code-tab");
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Fix: the (weird)   bug!!"), "fix-the-weird-bug");
    }

    #[test]
    fn slugify_unicode_falls_back_to_hyphens() {
        assert_eq!(slugify("héllo wörld"), "h-llo-w-rld");
    }

    #[test]
    fn slugify_truncates() {
        let long = "a".repeat(100);
        assert!(slugify(&long).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn branch_name_shape() {
        let id = Uuid::new_v4();
        let name = branch_name_for_task("Add code tab", id);
        assert!(name.starts_with("task-add-code-tab-"));
        assert_eq!(
            name.len(),
            "task-add-code-tab-".len() + SHORT_ID_LEN
        );
    }

    #[test]
    fn branch_name_empty_title() {
        let id = Uuid::new_v4();
        let name = branch_name_for_task("!!!", id);
        assert!(name.starts_with("task-"));
        assert_eq!(name.len(), "task-".len() + SHORT_ID_LEN);
    }

    #[test]
    fn branch_name_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(
            branch_name_for_task("Same title", id),
            branch_name_for_task("Same title", id)
        );
    }
}
