//! Virtual path normalisation

/// Normalise a user-supplied path into a rooted, cleaned form.
///
/// Backslashes are treated as separators, `.` and empty segments vanish, and
/// `..` above the root stays at the root:
/// `".."` → `"/"`, `"./x"` → `"/x"`, `"x//\\y"` → `"/x/y"`.
pub fn fix_and_clean_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut cleaned = String::with_capacity(path.len() + 1);
    cleaned.push('/');
    cleaned.push_str(&segments.join("/"));
    cleaned
}

#[cfg(test)]
mod tests {
    use super::fix_and_clean_path;

    #[test]
    fn cleans_relative_markers() {
        assert_eq!(fix_and_clean_path(".."), "/");
        assert_eq!(fix_and_clean_path("."), "/");
        assert_eq!(fix_and_clean_path("./x"), "/x");
        assert_eq!(fix_and_clean_path("../abc"), "/abc");
    }

    #[test]
    fn collapses_separators() {
        assert_eq!(fix_and_clean_path("x//\\y"), "/x/y");
        assert_eq!(fix_and_clean_path("/a/b/"), "/a/b");
    }

    #[test]
    fn parent_of_root_is_root() {
        assert_eq!(fix_and_clean_path("/a/../../b"), "/b");
        assert_eq!(fix_and_clean_path("../../.."), "/");
    }
}
