use std::str::FromStr;

/// Credentials for one private registry, parsed from the command line
/// as a `host[/path]=user=password` triple. The host is given without a
/// scheme; clients probe https first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryAuth {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl FromStr for RegistryAuth {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.splitn(3, '=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(url), Some(user), Some(password))
                if !url.is_empty() && !user.is_empty() && !password.is_empty() =>
            {
                Ok(Self {
                    url: url.trim_end_matches('/').to_string(),
                    user: user.to_string(),
                    password: password.to_string(),
                })
            }
            _ => Err(format!(
                "invalid registry credential {raw:?}: expected url=user=password"
            )),
        }
    }
}

impl RegistryAuth {
    /// The registry host, without any path the URL may carry.
    pub fn host(&self) -> &str {
        self.url.split('/').next().unwrap_or(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_credential_triple() {
        let auth: RegistryAuth = "artifactory.example.com=admin=s3cret"
            .parse()
            .expect("must parse");
        assert_eq!(auth.url, "artifactory.example.com");
        assert_eq!(auth.user, "admin");
        assert_eq!(auth.password, "s3cret");
    }

    #[test]
    fn keeps_equals_signs_in_the_password() {
        let auth: RegistryAuth = "quay.example.com=bot=a=b=c".parse().expect("must parse");
        assert_eq!(auth.password, "a=b=c");
    }

    #[test]
    fn host_strips_any_registry_path() {
        let auth: RegistryAuth = "quay.example.com/team=bot=pw".parse().expect("must parse");
        assert_eq!(auth.host(), "quay.example.com");
    }

    #[test]
    fn rejects_incomplete_triples() {
        assert!("no-credentials".parse::<RegistryAuth>().is_err());
        assert!("host=user".parse::<RegistryAuth>().is_err());
        assert!("=user=pw".parse::<RegistryAuth>().is_err());
    }
}
