/// Builds the shell command line for a coding agent, with optional
/// user-supplied overrides layered on top of the executor defaults.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    base: String,
    params: Vec<String>,
}

impl CommandBuilder {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn build_initial(&self) -> String {
        self.join(&[])
    }

    pub fn build_follow_up(&self, additional: &[String]) -> String {
        self.join(additional)
    }

    fn join(&self, additional: &[String]) -> String {
        let mut parts = vec![self.base.clone()];
        parts.extend(self.params.iter().cloned());
        parts.extend(additional.iter().cloned());
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_up_appends_resume_args() {
        let builder = CommandBuilder::new("agent").params(["-p", "--json"]);
        assert_eq!(builder.build_initial(), "agent -p --json");
        assert_eq!(
            builder.build_follow_up(&["--resume".into(), "abc".into()]),
            "agent -p --json --resume abc"
        );
    }
}
