//! IAM role and policy management for the worker function.
//!
//! The deployed role lets the Lambda service assume it, and its inline
//! policy grants log writes, function invocation, VPC network interface
//! management, and object-store access. Both documents are compared by
//! content and updated in place when drift is detected.

use anyhow::{anyhow, Context, Result};
use aws_sdk_iam as iam;
use tracing::{debug, info};

/// Name of the inline policy attached to the managed role.
const POLICY_NAME: &str = "drover-permissions";

/// Trust policy permitting the Lambda service to assume the role.
const ASSUME_ROLE_DOCUMENT: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Sid": "",
      "Effect": "Allow",
      "Principal": {
        "Service": [
          "lambda.amazonaws.com"
        ]
      },
      "Action": "sts:AssumeRole"
    }
  ]
}"#;

/// Inline permissions granted to the worker function.
const PERMISSIONS_DOCUMENT: &str = r#"{
    "Version": "2012-10-17",
    "Statement": [
        {
            "Effect": "Allow",
            "Action": [
                "logs:*"
            ],
            "Resource": "arn:aws:logs:*:*:*"
        },
        {
            "Effect": "Allow",
            "Action": [
                "lambda:InvokeFunction"
            ],
            "Resource": [
                "*"
            ]
        },
        {
            "Effect": "Allow",
            "Action": [
                "ec2:AttachNetworkInterface",
                "ec2:CreateNetworkInterface",
                "ec2:DeleteNetworkInterface",
                "ec2:DescribeInstances",
                "ec2:DescribeNetworkInterfaces",
                "ec2:DetachNetworkInterface",
                "ec2:ModifyNetworkInterfaceAttribute",
                "ec2:ResetNetworkInterfaceAttribute"
            ],
            "Resource": "*"
        },
        {
            "Effect": "Allow",
            "Action": [
                "s3:*"
            ],
            "Resource": "arn:aws:s3:::*"
        }
    ]
}"#;

/// Manages the execution role the worker function runs under.
pub(crate) struct IamClient {
    client: iam::Client,
}

impl IamClient {
    pub async fn new() -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self {
            client: iam::Client::new(&config),
        })
    }

    /// Creates or refreshes the role and its inline policy. Returns the
    /// role's ARN.
    pub async fn deploy_permissions(&self, role_name: &str) -> Result<String> {
        let role_arn = self.deploy_role(role_name).await?;
        self.deploy_policy(role_name).await?;
        Ok(role_arn)
    }

    async fn deploy_role(&self, role_name: &str) -> Result<String> {
        match self.client.get_role().role_name(role_name).send().await {
            Ok(output) => {
                let role = output
                    .role()
                    .ok_or_else(|| anyhow!("role '{role_name}' has no definition"))?;
                debug!("role '{role_name}' already exists");

                let stored = role.assume_role_policy_document().unwrap_or_default();
                if !documents_match(stored, ASSUME_ROLE_DOCUMENT) {
                    info!("updating trust policy of role '{role_name}'");
                    self.client
                        .update_assume_role_policy()
                        .role_name(role_name)
                        .policy_document(ASSUME_ROLE_DOCUMENT)
                        .send()
                        .await?;
                }
                Ok(role.arn().to_string())
            }
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_entity_exception())
                    .unwrap_or(false) =>
            {
                info!("creating role '{role_name}'");
                let created = self
                    .client
                    .create_role()
                    .role_name(role_name)
                    .assume_role_policy_document(ASSUME_ROLE_DOCUMENT)
                    .send()
                    .await?;
                let role = created
                    .role()
                    .ok_or_else(|| anyhow!("created role '{role_name}' has no definition"))?;
                Ok(role.arn().to_string())
            }
            Err(err) => Err(err).context("looking up role"),
        }
    }

    async fn deploy_policy(&self, role_name: &str) -> Result<()> {
        let up_to_date = match self
            .client
            .get_role_policy()
            .role_name(role_name)
            .policy_name(POLICY_NAME)
            .send()
            .await
        {
            Ok(output) => {
                debug!("policy '{POLICY_NAME}' already exists");
                documents_match(output.policy_document(), PERMISSIONS_DOCUMENT)
            }
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_entity_exception())
                    .unwrap_or(false) =>
            {
                false
            }
            Err(err) => return Err(err).context("looking up role policy"),
        };

        if !up_to_date {
            info!("writing policy '{POLICY_NAME}'");
            self.client
                .put_role_policy()
                .role_name(role_name)
                .policy_name(POLICY_NAME)
                .policy_document(PERMISSIONS_DOCUMENT)
                .send()
                .await?;
        }
        Ok(())
    }

    /// Tears down the managed role and its policy. Entities that are
    /// already gone are treated as deleted.
    pub async fn delete_permissions(&self, role_name: &str) -> Result<()> {
        debug!("deleting policy '{POLICY_NAME}'");
        if let Err(err) = self
            .client
            .delete_role_policy()
            .role_name(role_name)
            .policy_name(POLICY_NAME)
            .send()
            .await
        {
            if !err
                .as_service_error()
                .map(|e| e.is_no_such_entity_exception())
                .unwrap_or(false)
            {
                return Err(err).context("deleting role policy");
            }
        }

        debug!("deleting role '{role_name}'");
        if let Err(err) = self.client.delete_role().role_name(role_name).send().await {
            if !err
                .as_service_error()
                .map(|e| e.is_no_such_entity_exception())
                .unwrap_or(false)
            {
                return Err(err).context("deleting role");
            }
        }
        Ok(())
    }
}

/// Policy documents read back from the API arrive URL-encoded and may be
/// reformatted; equality is judged on the decoded JSON.
fn documents_match(stored: &str, desired: &str) -> bool {
    let decoded = match percent_encoding::percent_decode_str(stored).decode_utf8() {
        Ok(decoded) => decoded,
        Err(_) => return false,
    };

    let stored_json: Result<serde_json::Value, _> = serde_json::from_str(&decoded);
    let desired_json: Result<serde_json::Value, _> = serde_json::from_str(desired);
    match (stored_json, desired_json) {
        (Ok(stored), Ok(desired)) => stored == desired,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_comparison_ignores_encoding_and_formatting() {
        let stored = "%7B%22Version%22%3A%20%222012-10-17%22%2C%20%22Statement%22%3A%20%5B%5D%7D";
        assert!(documents_match(
            stored,
            "{\n  \"Version\": \"2012-10-17\",\n  \"Statement\": []\n}"
        ));
    }

    #[test]
    fn document_comparison_detects_drift() {
        let stored = "%7B%22Version%22%3A%20%222012-10-17%22%7D";
        assert!(!documents_match(stored, "{\"Version\": \"2008-10-17\"}"));
        assert!(!documents_match("not json", PERMISSIONS_DOCUMENT));
    }

    #[test]
    fn shipped_documents_are_valid_json() {
        serde_json::from_str::<serde_json::Value>(ASSUME_ROLE_DOCUMENT).unwrap();
        serde_json::from_str::<serde_json::Value>(PERMISSIONS_DOCUMENT).unwrap();
    }
}
