//! Process configuration, read once from the environment at startup.

use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub frontend_url: String,
    /// Sparrow attendance API endpoint; bridge is disabled when unset.
    pub sparrow_endpoint: Option<String>,
    /// Expo push API access token; push dispatch logs-only when unset.
    pub expo_access_token: Option<String>,
    pub app_env: AppEnv,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            port: env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8080),
            database_url: required("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            jwt_secret: required("JWT_SECRET")?,
            frontend_url: env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".into()),
            sparrow_endpoint: env::var("SPARROW_ENDPOINT").ok().filter(|s| !s.is_empty()),
            expo_access_token: env::var("EXPO_ACCESS_TOKEN").ok().filter(|s| !s.is_empty()),
            app_env: match env::var("APP_ENV").as_deref() {
                Ok("production") => AppEnv::Production,
                _ => AppEnv::Development,
            },
        })
    }

    /// The attendance bridge only fires outside development unless a
    /// company explicitly opts in; see `shift::ShiftEngine`.
    pub fn is_production(&self) -> bool {
        self.app_env == AppEnv::Production
    }
}

fn required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("missing required environment variable {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_reports_missing_key() {
        let err = required("FIELDTRACK_TEST_DOES_NOT_EXIST").unwrap_err();
        assert!(err.contains("FIELDTRACK_TEST_DOES_NOT_EXIST"));
    }
}
