use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHubServiceError {
    #[error("GitHub token is not configured")]
    TokenMissing,
    #[error("Not a GitHub remote: {0}")]
    NotGitHubRemote(String),
    #[error(transparent)]
    Api(#[from] octocrab::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct PullRequestInfo {
    pub number: u64,
    pub url: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestComment {
    pub author: Option<String>,
    pub body: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePrRequest {
    pub title: String,
    pub body: Option<String>,
    pub base_branch: Option<String>,
}

/// Thin GitHub API wrapper for PR creation and review comments. Everything
/// else about remotes stays at the git layer.
#[derive(Clone)]
pub struct GitHubService {
    client: Octocrab,
}

impl GitHubService {
    pub fn new(token: Option<&str>) -> Result<Self, GitHubServiceError> {
        let token = token.ok_or(GitHubServiceError::TokenMissing)?;
        let client = Octocrab::builder()
            .personal_token(token.to_string())
            .build()?;
        Ok(Self { client })
    }

    /// Parse `owner/repo` from a GitHub remote url (ssh or https).
    pub fn parse_remote(remote_url: &str) -> Result<(String, String), GitHubServiceError> {
        let trimmed = remote_url.trim_end_matches(".git");
        let path = trimmed
            .strip_prefix("git@github.com:")
            .or_else(|| trimmed.strip_prefix("https://github.com/"))
            .or_else(|| trimmed.strip_prefix("ssh://git@github.com/"))
            .ok_or_else(|| GitHubServiceError::NotGitHubRemote(remote_url.to_string()))?;

        match path.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
                Ok((owner.to_string(), repo.to_string()))
            }
            _ => Err(GitHubServiceError::NotGitHubRemote(remote_url.to_string())),
        }
    }

    pub async fn create_pr(
        &self,
        owner: &str,
        repo: &str,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: Option<&str>,
    ) -> Result<PullRequestInfo, GitHubServiceError> {
        let pr = self
            .client
            .pulls(owner, repo)
            .create(title, head_branch, base_branch)
            .body(body.unwrap_or_default())
            .send()
            .await?;

        Ok(PullRequestInfo {
            number: pr.number,
            url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
            state: pr
                .state
                .map(|s| format!("{s:?}").to_lowercase())
                .unwrap_or_else(|| "open".to_string()),
        })
    }

    pub async fn get_pr(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestInfo, GitHubServiceError> {
        let pr = self.client.pulls(owner, repo).get(number).await?;
        Ok(PullRequestInfo {
            number: pr.number,
            url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
            state: pr
                .state
                .map(|s| format!("{s:?}").to_lowercase())
                .unwrap_or_else(|| "open".to_string()),
        })
    }

    pub async fn list_pr_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<PullRequestComment>, GitHubServiceError> {
        let page = self
            .client
            .issues(owner, repo)
            .list_comments(number)
            .send()
            .await?;

        Ok(page
            .items
            .into_iter()
            .map(|c| PullRequestComment {
                author: Some(c.user.login),
                body: c.body.unwrap_or_default(),
                created_at: Some(c.created_at.to_rfc3339()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_and_https_remotes() {
        assert_eq!(
            GitHubService::parse_remote("git@github.com:acme/widget.git").unwrap(),
            ("acme".to_string(), "widget".to_string())
        );
        assert_eq!(
            GitHubService::parse_remote("https://github.com/acme/widget").unwrap(),
            ("acme".to_string(), "widget".to_string())
        );
        assert!(GitHubService::parse_remote("https://gitlab.com/acme/widget").is_err());
    }
}
