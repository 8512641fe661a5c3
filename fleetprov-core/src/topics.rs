//! Fleet provisioning topic names.
//!
//! Each request kind has a request topic and an `accepted`/`rejected` pair the
//! service answers on. RegisterThing topics are scoped by template name.

use crate::request::{Outcome, RequestKind};

const CREATE_KEYS_AND_CERTIFICATE: &str = "$aws/certificates/create/json";
const CREATE_CERTIFICATE_FROM_CSR: &str = "$aws/certificates/create-from-csr/json";
const TEMPLATE_PREFIX: &str = "$aws/provisioning-templates/";
const PROVISION_SUFFIX: &str = "/provision/json";

const ACCEPTED: &str = "/accepted";
const REJECTED: &str = "/rejected";

/// Request topic plus its response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTopics {
    pub request: String,
    pub accepted: String,
    pub rejected: String,
}

impl RequestTopics {
    fn from_base(base: String) -> Self {
        Self {
            accepted: format!("{base}{ACCEPTED}"),
            rejected: format!("{base}{REJECTED}"),
            request: base,
        }
    }

    /// The response topic for `outcome`.
    pub fn response(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Accepted => &self.accepted,
            Outcome::Rejected => &self.rejected,
        }
    }
}

/// Topic table for one provisioning template.
#[derive(Debug, Clone)]
pub struct TopicTable {
    template_name: String,
}

impl TopicTable {
    pub fn new(template_name: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
        }
    }

    pub fn template_name(&self) -> &str {
        &self.template_name
    }

    /// Topics for a request kind.
    pub fn topics(&self, kind: RequestKind) -> RequestTopics {
        let base = match kind {
            RequestKind::CreateKeysAndCertificate => CREATE_KEYS_AND_CERTIFICATE.to_string(),
            RequestKind::CreateCertificateFromCsr => CREATE_CERTIFICATE_FROM_CSR.to_string(),
            RequestKind::RegisterThing => {
                format!("{TEMPLATE_PREFIX}{}{PROVISION_SUFFIX}", self.template_name)
            }
        };
        RequestTopics::from_base(base)
    }

    /// Resolve an inbound topic to the request and outcome it answers.
    ///
    /// Returns `None` for request topics, unknown topics and RegisterThing
    /// responses for other templates.
    pub fn route(&self, topic: &str) -> Option<(RequestKind, Outcome)> {
        let (base, outcome) = if let Some(base) = topic.strip_suffix(ACCEPTED) {
            (base, Outcome::Accepted)
        } else if let Some(base) = topic.strip_suffix(REJECTED) {
            (base, Outcome::Rejected)
        } else {
            return None;
        };

        let kind = match base {
            CREATE_KEYS_AND_CERTIFICATE => RequestKind::CreateKeysAndCertificate,
            CREATE_CERTIFICATE_FROM_CSR => RequestKind::CreateCertificateFromCsr,
            other => {
                let template = other
                    .strip_prefix(TEMPLATE_PREFIX)?
                    .strip_suffix(PROVISION_SUFFIX)?;
                if template != self.template_name {
                    return None;
                }
                RequestKind::RegisterThing
            }
        };
        Some((kind, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_topics_scoped_by_template() {
        let table = TopicTable::new("my-template");
        let topics = table.topics(RequestKind::RegisterThing);
        assert_eq!(
            topics.request,
            "$aws/provisioning-templates/my-template/provision/json"
        );
        assert_eq!(
            topics.accepted,
            "$aws/provisioning-templates/my-template/provision/json/accepted"
        );
        assert_eq!(
            topics.response(Outcome::Rejected),
            "$aws/provisioning-templates/my-template/provision/json/rejected"
        );
    }

    #[test]
    fn test_route_every_response_topic() {
        let table = TopicTable::new("my-template");
        for kind in [
            RequestKind::CreateKeysAndCertificate,
            RequestKind::CreateCertificateFromCsr,
            RequestKind::RegisterThing,
        ] {
            let topics = table.topics(kind);
            assert_eq!(table.route(&topics.accepted), Some((kind, Outcome::Accepted)));
            assert_eq!(table.route(&topics.rejected), Some((kind, Outcome::Rejected)));
            assert_eq!(table.route(&topics.request), None);
        }
    }

    #[test]
    fn test_route_ignores_other_template() {
        let table = TopicTable::new("my-template");
        let other = TopicTable::new("other").topics(RequestKind::RegisterThing);
        assert_eq!(table.route(&other.accepted), None);
    }

    #[test]
    fn test_route_unknown_topic() {
        let table = TopicTable::new("t");
        assert_eq!(table.route("sensors/temp/accepted"), None);
        assert_eq!(table.route(""), None);
    }
}
