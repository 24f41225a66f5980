use regex::Regex;
use uuid::Uuid;

pub fn git_branch_id(input: &str) -> String {
    let lower = input.to_lowercase();

    let re = Regex::new(r"[^a-z0-9]+").unwrap();
    let slug = re.replace_all(&lower, "-");

    let trimmed = slug.trim_matches('-');

    // take up to 10 chars, then trim trailing hyphens again
    let cut: String = trimmed.chars().take(10).collect();
    cut.trim_end_matches('-').to_string()
}

pub fn short_uuid(u: &Uuid) -> String {
    let full = u.simple().to_string();
    full.chars().take(4).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_id_slugifies() {
        assert_eq!(git_branch_id("Fix the Parser!"), "fix-the-pa");
        assert_eq!(git_branch_id("--hello--"), "hello");
        assert_eq!(git_branch_id(""), "");
    }

    #[test]
    fn short_uuid_is_four_chars() {
        let u = Uuid::new_v4();
        assert_eq!(short_uuid(&u).len(), 4);
    }
}
