//! Key policies, identity policies and the authorization decision.
//!
//! Documents use the familiar IAM JSON grammar:
//!
//! ```json
//! {
//!   "Version": "2012-10-17",
//!   "Statement": [{
//!     "Sid": "AllowDecryptForApp",
//!     "Effect": "Allow",
//!     "Principal": {"AWS": "arn:keyward:iam::111122223333:role/app"},
//!     "Action": ["kms:Decrypt", "kms:ReEncrypt*"],
//!     "Resource": "*",
//!     "Condition": {"StringEquals": {"kms:EncryptionContext:app": "billing"}}
//!   }]
//! }
//! ```
//!
//! A key policy statement naming an account root (`arn:..:iam::<acct>:root`
//! or the bare account id) delegates to that account's identity policies:
//! other principals of the account then need an identity-policy Allow as
//! well. Explicit Deny anywhere wins over every Allow and every grant.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::KmsError;
use crate::model::{principal_account, EncryptionContext, Grant, Operation};

/// The only accepted document version.
pub const POLICY_VERSION: &str = "2012-10-17";

/// Largest accepted document, in bytes.
pub const MAX_POLICY_SIZE: usize = 32 * 1024;

/// Name of the only key policy a key has.
pub const DEFAULT_POLICY_NAME: &str = "default";

// ============================================================================
// Document model
// ============================================================================

/// Statement effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Permit.
    Allow,
    /// Forbid, overriding any Allow.
    Deny,
}

/// A string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    /// A single value.
    One(String),
    /// Several values.
    Many(Vec<String>),
}

impl OneOrMany {
    /// The values.
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::One(v) => vec![v.as_str()],
            Self::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    fn any_action(&self, action: &str) -> bool {
        self.values().iter().any(|p| glob_match(p, action, false))
    }

    fn any_resource(&self, resource: &str) -> bool {
        self.values().iter().any(|p| glob_match(p, resource, true))
    }
}

/// `Principal` / `NotPrincipal` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrincipalSpec {
    /// `"*"`.
    Wildcard(String),
    /// `{"AWS": ...}`.
    Aws {
        /// Principal ARNs, account ids or `*`.
        #[serde(rename = "AWS")]
        aws: OneOrMany,
    },
}

/// How a statement's principal element relates to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrincipalMatch {
    /// Names the caller (or everyone).
    Direct,
    /// Names the root of the caller's account.
    Account,
    /// Does not apply.
    None,
}

impl PrincipalSpec {
    fn classify(&self, principal: &str, caller_account: Option<&str>) -> PrincipalMatch {
        let entries = match self {
            Self::Wildcard(w) if w == "*" => return PrincipalMatch::Direct,
            Self::Wildcard(_) => return PrincipalMatch::None,
            Self::Aws { aws } => aws.values(),
        };

        let mut result = PrincipalMatch::None;
        for entry in entries {
            if entry == "*" || entry == principal {
                return PrincipalMatch::Direct;
            }
            let names_account = caller_account.is_some_and(|account| {
                entry == account
                    || (entry.ends_with(":root") && principal_account(entry) == Some(account))
            });
            if names_account {
                result = PrincipalMatch::Account;
            }
        }
        result
    }
}

/// `Condition` block: operator → condition key → expected values.
pub type ConditionBlock = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

/// One statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    /// Statement id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Effect.
    pub effect: Effect,
    /// Principals the statement covers. Absent in identity policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<PrincipalSpec>,
    /// Principals the statement excludes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_principal: Option<PrincipalSpec>,
    /// Actions covered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<OneOrMany>,
    /// Actions excluded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_action: Option<OneOrMany>,
    /// Resources covered; absent means every resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<OneOrMany>,
    /// Conditions, all of which must hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionBlock>,
}

/// A policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    /// Grammar version.
    pub version: String,
    /// Optional document id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Statements.
    pub statement: Vec<Statement>,
}

/// Which kind of document is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Attached to a key; statements name principals.
    Key,
    /// Attached to a principal; statements name none.
    Identity,
}

impl PolicyDocument {
    /// Parses and validates a document.
    pub fn parse(json: &str, kind: PolicyKind) -> Result<Self, KmsError> {
        if json.len() > MAX_POLICY_SIZE {
            return Err(KmsError::Validation(format!(
                "policy exceeds {MAX_POLICY_SIZE} bytes"
            )));
        }
        let document: Self = serde_json::from_str(json)
            .map_err(|e| KmsError::Validation(format!("malformed policy document: {e}")))?;
        document.validate(kind)?;
        Ok(document)
    }

    /// Checks the document's structure.
    pub fn validate(&self, kind: PolicyKind) -> Result<(), KmsError> {
        if self.version != POLICY_VERSION {
            return Err(KmsError::Validation(format!(
                "unsupported policy version {}, expected {POLICY_VERSION}",
                self.version
            )));
        }
        if self.statement.is_empty() {
            return Err(KmsError::Validation("policy must have at least one statement".into()));
        }

        for (i, stmt) in self.statement.iter().enumerate() {
            match (&stmt.action, &stmt.not_action) {
                (Some(_), None) | (None, Some(_)) => {},
                _ => {
                    return Err(KmsError::Validation(format!(
                        "statement {i} needs exactly one of Action or NotAction"
                    )))
                },
            }
            for action in stmt.action.iter().chain(&stmt.not_action).flat_map(OneOrMany::values) {
                if !is_valid_action(action) {
                    return Err(KmsError::Validation(format!(
                        "invalid action in statement {i}: {action}"
                    )));
                }
            }

            let has_principal = stmt.principal.is_some() || stmt.not_principal.is_some();
            match kind {
                PolicyKind::Key if !has_principal => {
                    return Err(KmsError::Validation(format!(
                        "statement {i} of a key policy must name a principal"
                    )))
                },
                PolicyKind::Identity if has_principal => {
                    return Err(KmsError::Validation(format!(
                        "statement {i} of an identity policy may not name a principal"
                    )))
                },
                _ => {},
            }
        }
        Ok(())
    }

    /// Serializes the document.
    pub fn to_json(&self) -> Result<String, KmsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Policy installed by CreateKey when the caller supplies none: the account
/// root may do anything, which delegates access to identity policies.
pub fn default_key_policy(root_principal: &str) -> PolicyDocument {
    PolicyDocument {
        version: POLICY_VERSION.to_string(),
        id: Some("key-default-1".to_string()),
        statement: vec![Statement {
            sid: Some("Enable IAM User Permissions".to_string()),
            effect: Effect::Allow,
            principal: Some(PrincipalSpec::Aws {
                aws: OneOrMany::One(root_principal.to_string()),
            }),
            not_principal: None,
            action: Some(OneOrMany::One("kms:*".to_string())),
            not_action: None,
            resource: Some(OneOrMany::One("*".to_string())),
            condition: None,
        }],
    }
}

fn is_valid_action(action: &str) -> bool {
    if action == "*" {
        return true;
    }
    action.strip_prefix("kms:").is_some_and(|name| {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '?'))
    })
}

/// Glob match with `*` and `?`.
fn glob_match(pattern: &str, value: &str, case_sensitive: bool) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(['*', '?']) {
        return if case_sensitive {
            pattern == value
        } else {
            pattern.eq_ignore_ascii_case(value)
        };
    }

    let body = regex::escape(pattern).replace("\\*", ".*").replace("\\?", ".");
    let flags = if case_sensitive { "" } else { "(?i)" };
    Regex::new(&format!("{flags}^{body}$"))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

// ============================================================================
// Conditions
// ============================================================================

/// Request attributes conditions can test.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Calling principal.
    pub principal: &'a str,
    /// Account of the caller.
    pub caller_account: Option<&'a str>,
    /// Operation requested.
    pub operation: Operation,
    /// Resource ARN, or `*` for account-level operations.
    pub resource: &'a str,
    /// Encryption context of the request.
    pub encryption_context: Option<&'a EncryptionContext>,
}

enum Lookup {
    Unknown,
    Absent,
    Present(Vec<String>),
}

impl RequestContext<'_> {
    fn lookup(&self, key: &str) -> Lookup {
        const CONTEXT_PREFIX: &str = "kms:encryptioncontext:";

        let lower = key.to_ascii_lowercase();
        if lower.starts_with(CONTEXT_PREFIX) {
            let name = &key[CONTEXT_PREFIX.len()..];
            return match self.encryption_context.and_then(|c| c.get(name)) {
                Some(v) => Lookup::Present(vec![v.clone()]),
                None => Lookup::Absent,
            };
        }
        match lower.as_str() {
            "kms:encryptioncontextkeys" => match self.encryption_context {
                Some(c) if !c.is_empty() => Lookup::Present(c.keys().cloned().collect()),
                _ => Lookup::Absent,
            },
            "kms:calleraccount" => match self.caller_account {
                Some(a) => Lookup::Present(vec![a.to_string()]),
                None => Lookup::Absent,
            },
            "kms:grantisforawsresource" => Lookup::Present(vec!["false".to_string()]),
            _ => Lookup::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quantifier {
    Single,
    ForAnyValue,
    ForAllValues,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    StringEquals,
    StringNotEquals,
    StringLike,
    StringNotLike,
    Bool,
    Null,
}

impl Operator {
    fn parse(raw: &str) -> Option<(Quantifier, Self)> {
        let (quantifier, name) = if let Some(rest) = raw.strip_prefix("ForAnyValue:") {
            (Quantifier::ForAnyValue, rest)
        } else if let Some(rest) = raw.strip_prefix("ForAllValues:") {
            (Quantifier::ForAllValues, rest)
        } else {
            (Quantifier::Single, raw)
        };
        let op = match name {
            "StringEquals" => Self::StringEquals,
            "StringNotEquals" => Self::StringNotEquals,
            "StringLike" => Self::StringLike,
            "StringNotLike" => Self::StringNotLike,
            "Bool" => Self::Bool,
            "Null" => Self::Null,
            _ => return None,
        };
        Some((quantifier, op))
    }

    fn negated(self) -> bool {
        matches!(self, Self::StringNotEquals | Self::StringNotLike)
    }

    /// Whether one request value satisfies the operator against `expected`.
    fn holds_for(self, actual: &str, expected: &[String]) -> bool {
        match self {
            Self::StringEquals => expected.iter().any(|e| e == actual),
            Self::StringNotEquals => !expected.iter().any(|e| e == actual),
            Self::StringLike => expected.iter().any(|e| glob_match(e, actual, true)),
            Self::StringNotLike => !expected.iter().any(|e| glob_match(e, actual, true)),
            Self::Bool => expected.iter().any(|e| e.eq_ignore_ascii_case(actual)),
            Self::Null => false,
        }
    }
}

fn expected_values(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::String(s) => vec![s.clone()],
        serde_json::Value::Bool(b) => vec![b.to_string()],
        serde_json::Value::Number(n) => vec![n.to_string()],
        serde_json::Value::Array(items) => items.iter().flat_map(expected_values).collect(),
        _ => Vec::new(),
    }
}

fn condition_holds(
    operator: &str,
    key: &str,
    expected: &serde_json::Value,
    request: &RequestContext<'_>,
) -> bool {
    let Some((quantifier, op)) = Operator::parse(operator) else {
        debug!(operator, "Unsupported condition operator");
        return false;
    };
    let expected = expected_values(expected);
    let actual = match request.lookup(key) {
        Lookup::Unknown => {
            debug!(key, "Unsupported condition key");
            return false;
        },
        Lookup::Absent => None,
        Lookup::Present(values) => Some(values),
    };

    if op == Operator::Null {
        let want_absent = expected.iter().any(|e| e.eq_ignore_ascii_case("true"));
        return want_absent == actual.is_none();
    }

    let Some(actual) = actual else {
        return op.negated() || quantifier == Quantifier::ForAllValues;
    };
    match quantifier {
        Quantifier::ForAllValues => actual.iter().all(|a| op.holds_for(a, &expected)),
        Quantifier::ForAnyValue => actual.iter().any(|a| op.holds_for(a, &expected)),
        Quantifier::Single if op.negated() => actual.iter().all(|a| op.holds_for(a, &expected)),
        Quantifier::Single => actual.iter().any(|a| op.holds_for(a, &expected)),
    }
}

impl Statement {
    fn covers_request(&self, request: &RequestContext<'_>) -> bool {
        let action = request.operation.action();
        let action_ok = match (&self.action, &self.not_action) {
            (Some(a), _) => a.any_action(&action),
            (None, Some(na)) => !na.any_action(&action),
            (None, None) => false,
        };
        if !action_ok {
            return false;
        }
        if let Some(resource) = &self.resource {
            if !resource.any_resource(request.resource) {
                return false;
            }
        }
        self.condition.as_ref().map_or(true, |block| {
            block.iter().all(|(operator, entries)| {
                entries
                    .iter()
                    .all(|(key, expected)| condition_holds(operator, key, expected, request))
            })
        })
    }

    fn principal_match(&self, request: &RequestContext<'_>) -> PrincipalMatch {
        let classify = |spec: &PrincipalSpec| spec.classify(request.principal, request.caller_account);
        let included = match &self.principal {
            Some(spec) => classify(spec),
            None => PrincipalMatch::Direct,
        };
        match &self.not_principal {
            Some(spec) if classify(spec) != PrincipalMatch::None => PrincipalMatch::None,
            _ => included,
        }
    }

    fn label(&self) -> String {
        self.sid.clone().unwrap_or_else(|| "unnamed statement".to_string())
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Outcome of evaluating one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// An Allow statement applies.
    Allow,
    /// A Deny statement applies.
    Deny(String),
    /// Nothing applies.
    NotApplicable,
}

#[derive(Debug, Default)]
struct KeyPolicyOutcome {
    deny: Option<String>,
    allow: bool,
    delegated: bool,
}

fn evaluate_key_policy(policy: &PolicyDocument, request: &RequestContext<'_>) -> KeyPolicyOutcome {
    let mut outcome = KeyPolicyOutcome::default();
    for stmt in &policy.statement {
        let principal = stmt.principal_match(request);
        if principal == PrincipalMatch::None || !stmt.covers_request(request) {
            continue;
        }
        match (stmt.effect, principal) {
            (Effect::Deny, _) => outcome.deny = Some(stmt.label()),
            (Effect::Allow, PrincipalMatch::Direct) => outcome.allow = true,
            (Effect::Allow, _) => outcome.delegated = true,
        }
    }
    outcome
}

/// Evaluates an identity policy for a request.
pub fn evaluate_identity_policy(policy: &PolicyDocument, request: &RequestContext<'_>) -> Decision {
    let mut allow = false;
    for stmt in &policy.statement {
        if !stmt.covers_request(request) {
            continue;
        }
        match stmt.effect {
            Effect::Deny => return Decision::Deny(stmt.label()),
            Effect::Allow => allow = true,
        }
    }
    if allow {
        Decision::Allow
    } else {
        Decision::NotApplicable
    }
}

/// Everything the evaluator needs for one key-scoped request.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationInput<'a> {
    /// Request attributes.
    pub request: RequestContext<'a>,
    /// The key's policy.
    pub key_policy: &'a PolicyDocument,
    /// Identity policies attached to the caller.
    pub identity_policies: &'a [PolicyDocument],
    /// Grants presented by token.
    pub token_grants: &'a [Grant],
    /// Grants visible by id lookup.
    pub visible_grants: &'a [Grant],
}

/// What allowed a key-scoped request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// The key policy, directly or through identity policies.
    Policy,
    /// A grant, presented by token or visible by id.
    Grant(Grant),
}

/// Combines key policies, identity policies and grants into a decision.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    root_principal: String,
}

impl PolicyEvaluator {
    /// Creates an evaluator for the account whose root is `root_principal`.
    pub fn new(root_principal: impl Into<String>) -> Self {
        Self {
            root_principal: root_principal.into(),
        }
    }

    /// Decides a key-scoped request.
    ///
    /// Order: explicit Deny, then grants presented by token, then the key
    /// policy (directly or delegated to identity policies), then grants
    /// visible by id.
    pub fn authorize(&self, input: &AuthorizationInput<'_>) -> Result<Authorization, KmsError> {
        let request = &input.request;
        let key_outcome = evaluate_key_policy(input.key_policy, request);
        if let Some(sid) = key_outcome.deny {
            return Err(self.denied(request, &format!("explicit deny in key policy ({sid})")));
        }

        let mut identity_allow = false;
        for policy in input.identity_policies {
            match evaluate_identity_policy(policy, request) {
                Decision::Deny(sid) => {
                    return Err(
                        self.denied(request, &format!("explicit deny in identity policy ({sid})"))
                    )
                },
                Decision::Allow => identity_allow = true,
                Decision::NotApplicable => {},
            }
        }

        let grant_permits = |grants: &[Grant]| {
            grants
                .iter()
                .find(|g| g.permits(request.principal, request.operation, request.encryption_context))
                .cloned()
        };

        if let Some(grant) = grant_permits(input.token_grants) {
            debug!(grant_id = %grant.grant_id, "Authorized by grant token");
            return Ok(Authorization::Grant(grant));
        }
        if key_outcome.allow {
            return Ok(Authorization::Policy);
        }
        if key_outcome.delegated && identity_allow {
            return Ok(Authorization::Policy);
        }
        if let Some(grant) = grant_permits(input.visible_grants) {
            debug!(grant_id = %grant.grant_id, "Authorized by grant");
            return Ok(Authorization::Grant(grant));
        }

        Err(self.denied(request, "no policy or grant allows it"))
    }

    /// Decides an account-level request (CreateKey, ListKeys, ...).
    ///
    /// The account root is allowed unless an identity policy denies; other
    /// principals of the account need an identity-policy Allow.
    pub fn authorize_account(
        &self,
        request: &RequestContext<'_>,
        identity_policies: &[PolicyDocument],
    ) -> Result<(), KmsError> {
        let mut allow = request.principal == self.root_principal;
        for policy in identity_policies {
            match evaluate_identity_policy(policy, request) {
                Decision::Deny(sid) => {
                    return Err(
                        self.denied(request, &format!("explicit deny in identity policy ({sid})"))
                    )
                },
                Decision::Allow => allow = true,
                Decision::NotApplicable => {},
            }
        }
        if allow {
            Ok(())
        } else {
            Err(self.denied(request, "no identity policy allows it"))
        }
    }

    fn denied(&self, request: &RequestContext<'_>, reason: &str) -> KmsError {
        debug!(
            principal = request.principal,
            action = %request.operation.action(),
            resource = request.resource,
            reason,
            "Access denied"
        );
        KmsError::AccessDenied(format!(
            "{} is not authorized to perform {} on {}: {reason}",
            request.principal,
            request.operation.action(),
            request.resource
        ))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    const ROOT: &str = "arn:keyward:iam::111122223333:root";
    const APP: &str = "arn:keyward:iam::111122223333:role/app";
    const OUTSIDER: &str = "arn:keyward:iam::444455556666:role/app";
    const KEY: &str = "arn:keyward:kms:us-east-1:111122223333:key/k1";

    fn request<'a>(
        principal: &'a str,
        operation: Operation,
        context: Option<&'a EncryptionContext>,
    ) -> RequestContext<'a> {
        RequestContext {
            principal,
            caller_account: principal_account(principal),
            operation,
            resource: KEY,
            encryption_context: context,
        }
    }

    fn authorize(
        key_policy: &PolicyDocument,
        identity: &[PolicyDocument],
        grants: &[Grant],
        request: RequestContext<'_>,
    ) -> Result<Authorization, KmsError> {
        PolicyEvaluator::new(ROOT).authorize(&AuthorizationInput {
            request,
            key_policy,
            identity_policies: identity,
            token_grants: grants,
            visible_grants: &[],
        })
    }

    fn doc(json: &str, kind: PolicyKind) -> PolicyDocument {
        PolicyDocument::parse(json, kind).unwrap()
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("kms:*", "kms:Encrypt", false));
        assert!(glob_match("kms:ReEncrypt*", "kms:ReEncryptFrom", false));
        assert!(glob_match("kms:encrypt", "kms:Encrypt", false));
        assert!(!glob_match("kms:Decrypt", "kms:Encrypt", false));
        assert!(glob_match("arn:keyward:kms:*:111122223333:key/*", KEY, true));
        assert!(glob_match("a?c", "abc", true));
        assert!(!glob_match("a.c", "abc", true));
    }

    #[test]
    fn test_validation() {
        assert!(PolicyDocument::parse("{", PolicyKind::Key).is_err());
        assert!(PolicyDocument::parse(
            r#"{"Version":"2008-10-17","Statement":[{"Effect":"Allow","Principal":"*","Action":"kms:*"}]}"#,
            PolicyKind::Key
        )
        .is_err());
        assert!(PolicyDocument::parse(r#"{"Version":"2012-10-17","Statement":[]}"#, PolicyKind::Key)
            .is_err());
        assert!(PolicyDocument::parse(
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":"*","Action":"s3:GetObject"}]}"#,
            PolicyKind::Key
        )
        .is_err());
        assert!(PolicyDocument::parse(
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":"kms:Encrypt"}]}"#,
            PolicyKind::Key
        )
        .is_err());
        assert!(PolicyDocument::parse(
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":"*","Action":"kms:Encrypt"}]}"#,
            PolicyKind::Identity
        )
        .is_err());
        let oversized = format!(r#"{{"Version":"2012-10-17","Id":"{}","Statement":[]}}"#, "x".repeat(MAX_POLICY_SIZE));
        assert!(PolicyDocument::parse(&oversized, PolicyKind::Key).is_err());
    }

    #[test]
    fn test_default_policy_roundtrips_and_allows_root() {
        let policy = default_key_policy(ROOT);
        let parsed = doc(&policy.to_json().unwrap(), PolicyKind::Key);
        assert_eq!(parsed, policy);

        let allowed =
            authorize(&policy, &[], &[], request(ROOT, Operation::ScheduleKeyDeletion, None)).unwrap();
        assert_eq!(allowed, Authorization::Policy);
        assert!(matches!(
            authorize(&policy, &[], &[], request(APP, Operation::Encrypt, None)),
            Err(KmsError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_root_statement_delegates_to_identity_policies() {
        let policy = default_key_policy(ROOT);
        let identity = doc(
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":["kms:Encrypt","kms:Decrypt"],"Resource":"arn:keyward:kms:*:111122223333:key/*"}]}"#,
            PolicyKind::Identity,
        );
        authorize(&policy, &[identity.clone()], &[], request(APP, Operation::Encrypt, None)).unwrap();
        assert!(authorize(&policy, &[identity.clone()], &[], request(APP, Operation::Sign, None)).is_err());
        // Another account's identity policy cannot use this account's delegation.
        assert!(authorize(&policy, &[identity], &[], request(OUTSIDER, Operation::Encrypt, None)).is_err());
    }

    #[test]
    fn test_explicit_deny_overrides_allow_and_grants() {
        let policy = doc(
            &format!(
                r#"{{"Version":"2012-10-17","Statement":[
                    {{"Effect":"Allow","Principal":{{"AWS":"{APP}"}},"Action":"kms:*","Resource":"*"}},
                    {{"Sid":"NoDecrypt","Effect":"Deny","Principal":"*","Action":"kms:Decrypt","Resource":"*"}}
                ]}}"#
            ),
            PolicyKind::Key,
        );
        authorize(&policy, &[], &[], request(APP, Operation::Encrypt, None)).unwrap();

        let grant = Grant {
            grant_id: "g".into(),
            key_id: "k1".into(),
            name: None,
            grantee_principal: APP.into(),
            retiring_principal: None,
            issuing_principal: ROOT.into(),
            operations: vec![Operation::Decrypt],
            constraints: None,
            created_at: 0,
        };
        let err = authorize(&policy, &[], &[grant], request(APP, Operation::Decrypt, None)).unwrap_err();
        assert!(err.to_string().contains("NoDecrypt"));
    }

    #[test]
    fn test_grant_allows_without_policy() {
        let policy = default_key_policy(ROOT);
        let ctx: EncryptionContext = [("app".to_string(), "x".to_string())].into();
        let grant = Grant {
            grant_id: "g".into(),
            key_id: "k1".into(),
            name: None,
            grantee_principal: APP.into(),
            retiring_principal: None,
            issuing_principal: ROOT.into(),
            operations: vec![Operation::Decrypt],
            constraints: Some(crate::model::GrantConstraints {
                encryption_context_subset: Some(ctx.clone()),
                encryption_context_equals: None,
            }),
            created_at: 0,
        };
        let allowed =
            authorize(&policy, &[], &[grant.clone()], request(APP, Operation::Decrypt, Some(&ctx))).unwrap();
        assert_eq!(allowed, Authorization::Grant(grant.clone()));
        assert!(authorize(&policy, &[], &[grant.clone()], request(APP, Operation::Decrypt, None)).is_err());
        assert!(authorize(&policy, &[], &[grant], request(APP, Operation::Encrypt, Some(&ctx))).is_err());
    }

    #[test]
    fn test_conditions() {
        let policy = doc(
            &format!(
                r#"{{"Version":"2012-10-17","Statement":[{{
                    "Effect":"Allow","Principal":{{"AWS":"{APP}"}},"Action":"kms:Decrypt","Resource":"*",
                    "Condition":{{
                        "StringEquals":{{"kms:EncryptionContext:app":["billing","ledger"]}},
                        "Bool":{{"kms:GrantIsForAWSResource":false}}
                    }}
                }}]}}"#
            ),
            PolicyKind::Key,
        );
        let billing: EncryptionContext = [("app".to_string(), "billing".to_string())].into();
        let other: EncryptionContext = [("app".to_string(), "crm".to_string())].into();
        authorize(&policy, &[], &[], request(APP, Operation::Decrypt, Some(&billing))).unwrap();
        assert!(authorize(&policy, &[], &[], request(APP, Operation::Decrypt, Some(&other))).is_err());
        assert!(authorize(&policy, &[], &[], request(APP, Operation::Decrypt, None)).is_err());
    }

    #[test]
    fn test_condition_edge_cases() {
        let ctx: EncryptionContext = [
            ("app".to_string(), "x".to_string()),
            ("env".to_string(), "prod".to_string()),
        ]
        .into();
        let req = request(APP, Operation::Decrypt, Some(&ctx));
        let empty = request(APP, Operation::Decrypt, None);
        let holds = |op: &str, key: &str, v: serde_json::Value, r: &RequestContext<'_>| {
            condition_holds(op, key, &v, r)
        };

        assert!(holds("StringLike", "kms:EncryptionContext:env", "pr*".into(), &req));
        assert!(holds("StringNotEquals", "kms:EncryptionContext:env", "dev".into(), &req));
        assert!(holds("StringNotEquals", "kms:EncryptionContext:env", "dev".into(), &empty));
        assert!(!holds("StringEquals", "kms:EncryptionContext:env", "prod".into(), &empty));
        assert!(holds(
            "ForAllValues:StringEquals",
            "kms:EncryptionContextKeys",
            serde_json::json!(["app", "env", "team"]),
            &req
        ));
        assert!(!holds(
            "ForAllValues:StringEquals",
            "kms:EncryptionContextKeys",
            serde_json::json!(["app"]),
            &req
        ));
        assert!(holds(
            "ForAnyValue:StringEquals",
            "kms:EncryptionContextKeys",
            serde_json::json!(["app"]),
            &req
        ));
        assert!(holds("Null", "kms:EncryptionContextKeys", "true".into(), &empty));
        assert!(holds("Null", "kms:EncryptionContextKeys", "false".into(), &req));
        assert!(holds("StringEquals", "kms:CallerAccount", "111122223333".into(), &req));
        assert!(!holds("StringEquals", "aws:SourceIp", "10.0.0.1".into(), &req));
        assert!(!holds("NumericLessThan", "kms:CallerAccount", "1".into(), &req));
    }

    #[test]
    fn test_not_principal_and_not_action() {
        let policy = doc(
            &format!(
                r#"{{"Version":"2012-10-17","Statement":[
                    {{"Effect":"Allow","Principal":"*","NotAction":"kms:ScheduleKeyDeletion","Resource":"*"}},
                    {{"Effect":"Deny","NotPrincipal":{{"AWS":["{APP}","{ROOT}"]}},"Action":"kms:*","Resource":"*"}}
                ]}}"#
            ),
            PolicyKind::Key,
        );
        authorize(&policy, &[], &[], request(APP, Operation::Encrypt, None)).unwrap();
        assert!(authorize(&policy, &[], &[], request(APP, Operation::ScheduleKeyDeletion, None)).is_err());
        assert!(authorize(&policy, &[], &[], request(OUTSIDER, Operation::Encrypt, None)).is_err());
    }

    #[test]
    fn test_account_level_requests() {
        let evaluator = PolicyEvaluator::new(ROOT);
        let account_request = |principal| RequestContext {
            principal,
            caller_account: principal_account(principal),
            operation: Operation::CreateKey,
            resource: "*",
            encryption_context: None,
        };
        evaluator.authorize_account(&account_request(ROOT), &[]).unwrap();
        assert!(evaluator.authorize_account(&account_request(APP), &[]).is_err());

        let allow = doc(
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":"kms:Create*","Resource":"*"}]}"#,
            PolicyKind::Identity,
        );
        evaluator.authorize_account(&account_request(APP), &[allow]).unwrap();

        let deny = doc(
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Deny","Action":"kms:CreateKey"}]}"#,
            PolicyKind::Identity,
        );
        assert!(evaluator.authorize_account(&account_request(ROOT), &[deny]).is_err());
    }
}
