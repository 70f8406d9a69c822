//! DynamoDB-backed [`ProgressLedger`].
//!
//! One item per ledger key, written with upsert-style `UpdateItem` so
//! concurrent workers on the same job merge rather than clobber.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::Utc;

use crate::error::{MigrateError, Result};

use super::{ProgressLedger, RoundStart, TerminalStatus};

pub struct DynamoLedger {
    client: Client,
    table: String,
}

impl DynamoLedger {
    pub fn new(client: Client, table: String) -> Self {
        Self { client, table }
    }

    fn ledger_err(op: &str, err: impl std::fmt::Display) -> MigrateError {
        MigrateError::Ledger(format!("{}: {}", op, err))
    }
}

#[async_trait]
impl ProgressLedger for DynamoLedger {
    async fn record_round_start(&self, round: &RoundStart) -> Result<()> {
        // "Size" and "Key" are DynamoDB reserved words, alias every
        // expression attribute.
        let mut sets = vec![
            "#pct = :pct",
            "#sz = :sz",
            "#db = :db",
            "#dk = :dk",
            "#st = :st",
        ];
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("Key", AttributeValue::S(round.key.clone()))
            .expression_attribute_names("#pct", "lastTimeProgress")
            .expression_attribute_names("#sz", "totalSize")
            .expression_attribute_names("#db", "desBucket")
            .expression_attribute_names("#dk", "desKey")
            .expression_attribute_names("#st", "jobStatus")
            .expression_attribute_names("#tries", "tryTimes")
            .expression_attribute_names("#workers", "workerIds")
            .expression_attribute_values(":pct", AttributeValue::N(round.percent.to_string()))
            .expression_attribute_values(":sz", AttributeValue::N(round.size.to_string()))
            .expression_attribute_values(":db", AttributeValue::S(round.des_bucket.clone()))
            .expression_attribute_values(":dk", AttributeValue::S(round.des_key.clone()))
            .expression_attribute_values(":st", AttributeValue::S("RUNNING".to_string()))
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .expression_attribute_values(
                ":worker",
                AttributeValue::Ss(vec![round.worker_id.clone()]),
            );
        if round.first_round {
            sets.push("#begin = :begin");
            request = request
                .expression_attribute_names("#begin", "startTime")
                .expression_attribute_values(":begin", AttributeValue::S(Utc::now().to_rfc3339()));
            if let Some(version) = &round.version_id {
                sets.push("#ver = :ver");
                request = request
                    .expression_attribute_names("#ver", "versionId")
                    .expression_attribute_values(":ver", AttributeValue::S(version.clone()));
            }
        }
        let expr = format!(
            "SET {} ADD #tries :one, #workers :worker",
            sets.join(", ")
        );
        request
            .update_expression(expr)
            .send()
            .await
            .map_err(|e| Self::ledger_err("round start", e))?;
        Ok(())
    }

    async fn record_terminal(
        &self,
        key: &str,
        status: TerminalStatus,
        etag: Option<&str>,
    ) -> Result<()> {
        let mut expr = String::from("SET #st = :st, #end = :end");
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("Key", AttributeValue::S(key.to_string()))
            .expression_attribute_names("#st", "jobStatus")
            .expression_attribute_names("#end", "endTime")
            .expression_attribute_values(":st", AttributeValue::S(status.as_str().to_string()))
            .expression_attribute_values(":end", AttributeValue::S(Utc::now().to_rfc3339()));
        if status == TerminalStatus::Done {
            expr.push_str(", #pct = :pct");
            request = request
                .expression_attribute_names("#pct", "lastTimeProgress")
                .expression_attribute_values(":pct", AttributeValue::N("100".to_string()));
            if let Some(etag) = etag {
                expr.push_str(", #etag = :etag");
                request = request
                    .expression_attribute_names("#etag", "etag")
                    .expression_attribute_values(":etag", AttributeValue::S(etag.to_string()));
            }
        }
        request
            .update_expression(expr)
            .send()
            .await
            .map_err(|e| Self::ledger_err("terminal", e))?;
        Ok(())
    }

    async fn pinned_version(&self, key: &str) -> Result<Option<(String, i64)>> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("Key", AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(|e| Self::ledger_err("pinned version", e))?;
        let Some(item) = resp.item() else {
            return Ok(None);
        };
        let version = item
            .get("versionId")
            .and_then(|v| v.as_s().ok())
            .cloned();
        let size = item
            .get("totalSize")
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(version.map(|v| (v, size)))
    }

    async fn version_map(&self) -> Result<HashMap<String, String>> {
        let mut map = HashMap::new();
        let mut pages = self
            .client
            .scan()
            .table_name(&self.table)
            .projection_expression("#k, versionId")
            .expression_attribute_names("#k", "Key")
            .into_paginator()
            .items()
            .send();
        while let Some(item) = pages.next().await {
            let item = item.map_err(|e| Self::ledger_err("version map", e))?;
            let key = item.get("Key").and_then(|v| v.as_s().ok()).cloned();
            let version = item.get("versionId").and_then(|v| v.as_s().ok()).cloned();
            if let (Some(key), Some(version)) = (key, version) {
                map.insert(key, version);
            }
        }
        Ok(map)
    }
}
