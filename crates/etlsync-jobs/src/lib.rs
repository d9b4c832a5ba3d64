//! The catalogue of sync jobs: destination schema, transformation query,
//! optional valid-key query and default schedule for each one.

use etlsync_core::{ColumnSpec, ColumnType, TableSchema};

pub const CRATE_NAME: &str = "etlsync-jobs";

/// Which configured database a job's queries run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceConnection {
    ReadReplica,
    JobPosting,
}

/// Query producing the complete set of keys that may remain in the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSpec {
    pub valid_keys_sql: &'static str,
}

#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: &'static str,
    pub description: &'static str,
    /// Five-field cron expression, UTC.
    pub cron: &'static str,
    pub source: SourceConnection,
    pub schema: TableSchema,
    pub transform_sql: &'static str,
    pub reconcile: Option<ReconcileSpec>,
}

pub fn registry() -> Vec<JobDefinition> {
    vec![
        assignment_question_job(),
        topics_job(),
        course_user_point_mapping_job(),
        course_user_timeline_flow_mapping_job(),
        feedback_form_all_responses_job(),
        job_postings_job(),
    ]
}

pub fn job_by_name(name: &str) -> Option<JobDefinition> {
    registry().into_iter().find(|job| job.name == name)
}

pub fn job_names() -> Vec<&'static str> {
    registry().iter().map(|job| job.name).collect()
}

fn col(name: &str, ty: ColumnType) -> ColumnSpec {
    ColumnSpec::new(name, ty)
}

pub fn assignment_question_job() -> JobDefinition {
    use ColumnType::*;
    let schema = TableSchema::new(
        "assignment_question",
        "assignment_question_id",
        vec![
            col("assignment_question_id", BigInt).not_null(),
            col("created_at", Timestamp),
            col("created_by_id", BigInt),
            col("hash", Text),
            col("is_deleted", Boolean),
            col("max_points", Integer),
            col("max_marks", Integer),
            col("peer_reviewed", Boolean),
            col("peer_reviewed_by_id", BigInt),
            col("question_for_assignment_type", IntegerArray),
            col("question_title", Text),
            col("question_type", Integer),
            col("test_case_count", Integer),
            col("verified", Boolean),
            col("feedback_evaluable", Boolean),
            col("rating", BigInt),
            col("difficulty_type", Integer),
            col("mandatory", Boolean),
            col("topic_id", BigInt),
            col("question_utility_type", Integer),
            col("relevance", Integer),
        ],
    )
    .refreshable([
        "peer_reviewed",
        "peer_reviewed_by_id",
        "question_for_assignment_type",
        "question_title",
        "test_case_count",
        "verified",
        "rating",
        "difficulty_type",
        "mandatory",
        "topic_id",
        "question_utility_type",
        "relevance",
    ])
    .with_surrogate_id();

    JobDefinition {
        name: "assignment_question",
        description: "Assignment questions with their main topic mapping and test case count",
        cron: "30 20 * * *",
        source: SourceConnection::ReadReplica,
        schema,
        transform_sql: include_str!("../sql/assignment_question.sql"),
        reconcile: None,
    }
}

pub fn topics_job() -> JobDefinition {
    let schema = TableSchema::new(
        "topics",
        "topic_node_id",
        vec![
            col("topic_node_id", ColumnType::BigInt).not_null(),
            col("topic_id", ColumnType::BigInt),
            col("topic_name", ColumnType::Varchar(128)),
            col("topic_template_id", ColumnType::Integer),
            col("template_name", ColumnType::Varchar(128)),
        ],
    )
    .refreshable(["topic_name", "template_name"])
    .with_surrogate_id();

    JobDefinition {
        name: "topics",
        description: "Topic nodes of live non-course templates; stale nodes are removed",
        cron: "30 20 * * *",
        source: SourceConnection::ReadReplica,
        schema,
        transform_sql: include_str!("../sql/topics.sql"),
        reconcile: Some(ReconcileSpec {
            valid_keys_sql: include_str!("../sql/topics_valid_keys.sql"),
        }),
    }
}

/// Keyed on `user_id_object_id_content_type_id_version`, built from the
/// first four values of each source row.
pub fn course_user_point_mapping_job() -> JobDefinition {
    use ColumnType::*;
    let schema = TableSchema::new(
        "course_user_point_mapping",
        "table_unique_key",
        vec![
            col("table_unique_key", Text).not_null(),
            col("course_id", BigInt),
            col("course_name", Text),
            col("course_start_timestamp", Timestamp),
            col("course_end_timestamp", Timestamp),
            col("user_id", BigInt),
            col("created_at", Timestamp),
            col("content_type", Text),
            col("mcq_course_user_mapping_id", BigInt),
            col("lecture_id", BigInt),
            col("assignment_course_user_question_mapping_id", BigInt),
            col("one_to_one_id", BigInt),
            col("milestone_user_question_mapping_id", BigInt),
            col("points", Integer),
            col("is_deleted", Boolean),
            col("points_version", Text),
            col("topic_id", Integer),
            col("point_type", Integer),
        ],
    )
    .refreshable([
        "course_name",
        "course_start_timestamp",
        "course_end_timestamp",
        "created_at",
        "points",
        "is_deleted",
        "topic_id",
        "point_type",
    ])
    .composite_key(4, "_")
    .with_surrogate_id();

    JobDefinition {
        name: "course_user_point_mapping",
        description: "Points earned per user, object, content type and points version",
        cron: "0 21 * * *",
        source: SourceConnection::ReadReplica,
        schema,
        transform_sql: include_str!("../sql/course_user_point_mapping.sql"),
        reconcile: None,
    }
}

pub fn course_user_timeline_flow_mapping_job() -> JobDefinition {
    use ColumnType::*;
    let schema = TableSchema::new(
        "course_user_timeline_flow_mapping",
        "id",
        vec![
            col("id", Integer).not_null(),
            col("course_timeline_flow", Integer),
            col("created_at", Timestamp),
            col("course_id", Integer),
            col("course_user_mapping_id", BigInt),
            col("user_id", BigInt),
            col("apply_form_question_set", Integer),
        ],
    )
    .refreshable(["course_user_mapping_id"]);

    JobDefinition {
        name: "course_user_timeline_flow_mapping",
        description: "Timeline flow assigned to each course user",
        cron: "30 20 * * *",
        source: SourceConnection::ReadReplica,
        schema,
        transform_sql: include_str!("../sql/course_user_timeline_flow_mapping.sql"),
        reconcile: None,
    }
}

pub fn feedback_form_all_responses_job() -> JobDefinition {
    use ColumnType::*;
    let schema = TableSchema::new(
        "feedback_form_all_responses",
        "table_unique_key",
        vec![
            col("table_unique_key", DoublePrecision).not_null(),
            col("feedback_form_user_mapping_id", BigInt),
            col("user_id", BigInt),
            col("feedback_form_id", BigInt),
            col("course_id", Integer),
            col("feedback_question_id", Integer),
            col("created_at", Timestamp),
            col("completed_at", Timestamp),
            col("entity_content_type_id", Integer),
            col("entity_object_id", BigInt),
            col("feedback_answer", Varchar(60000)),
        ],
    )
    .refresh_all();

    JobDefinition {
        name: "feedback_form_all_responses",
        description: "One row per user per feedback question response",
        cron: "0 5 * * *",
        source: SourceConnection::ReadReplica,
        schema,
        transform_sql: include_str!("../sql/feedback_form_all_responses.sql"),
        reconcile: None,
    }
}

pub fn job_postings_job() -> JobDefinition {
    use ColumnType::*;
    let schema = TableSchema::new(
        "job_postings",
        "table_unique_key",
        vec![
            col("table_unique_key", Varchar(200)).not_null(),
            col("skills", Jsonb),
            col("company", Varchar(200)),
            col("max_ctc", Real),
            col("min_ctc", Real),
            col("job_role", Varchar(200)),
            col("job_type", Varchar(200)),
            col("job_title", Varchar(200)),
            col("department", Varchar(200)),
            col("job_source", Varchar(50)),
            col("is_duplicate", Boolean),
            col("job_location", Varchar(200)),
            col("raw_response", Jsonb),
            col("max_experience", Integer),
            col("min_experience", Integer),
            col("relevancy_score", Integer),
            col("job_description_url", Varchar(500)),
            col("job_description_raw_text", Varchar(35000)),
            col("job_description_url_without_job_id", Varchar(400)),
            col("_airbyte_ab_id", Varchar(50)),
            col("_airbyte_emitted_at", Date),
            col("_airbyte_normalized_at", Date),
            col("_airbyte_job_openings_hashid", Varchar(200)),
            col("_airbyte_unique_key", Varchar(200)),
            col("number_of_openings", Integer),
        ],
    )
    .refresh_all()
    .with_surrogate_id();

    JobDefinition {
        name: "job_postings",
        description: "Job openings from the job posting analytics database",
        cron: "30 15 * * *",
        source: SourceConnection::JobPosting,
        schema,
        transform_sql: include_str!("../sql/job_postings.sql"),
        reconcile: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etlsync_core::KeySpec;
    use std::collections::HashSet;

    fn select_list_len(sql: &str) -> usize {
        // top-level items between the outermost `select` and its `from`
        let lower = sql.to_ascii_lowercase();
        let start = lower.find("select").unwrap() + "select".len();
        let end = start + lower[start..].find("\nfrom ").unwrap();
        let mut depth = 0i32;
        let mut count = 1;
        for ch in lower[start..end].chars() {
            match ch {
                '(' => depth += 1,
                ')' => depth -= 1,
                ',' if depth == 0 => count += 1,
                _ => {}
            }
        }
        count
    }

    #[test]
    fn every_job_schema_validates() {
        for job in registry() {
            job.schema.validate().unwrap_or_else(|e| panic!("{}: {e}", job.name));
        }
    }

    #[test]
    fn job_names_and_tables_are_unique() {
        let jobs = registry();
        assert_eq!(jobs.len(), 6);
        let names: HashSet<_> = jobs.iter().map(|j| j.name).collect();
        let tables: HashSet<_> = jobs.iter().map(|j| j.schema.table.as_str()).collect();
        assert_eq!(names.len(), jobs.len());
        assert_eq!(tables.len(), jobs.len());
    }

    #[test]
    fn cron_expressions_have_five_fields() {
        for job in registry() {
            assert_eq!(job.cron.split_whitespace().count(), 5, "{}", job.name);
        }
    }

    #[test]
    fn transform_queries_match_source_arity() {
        for job in registry() {
            if job.name == "feedback_form_all_responses" {
                continue;
            }
            assert_eq!(
                select_list_len(job.transform_sql),
                job.schema.source_arity(),
                "{}",
                job.name
            );
        }
    }

    #[test]
    fn only_topics_reconciles() {
        let reconciled: Vec<_> = registry()
            .into_iter()
            .filter(|j| j.reconcile.is_some())
            .map(|j| j.name)
            .collect();
        assert_eq!(reconciled, vec!["topics"]);
    }

    #[test]
    fn points_table_uses_four_part_composite_key() {
        let job = course_user_point_mapping_job();
        assert_eq!(
            job.schema.key_spec,
            KeySpec::Composite {
                components: 4,
                separator: "_".to_string()
            }
        );
        assert_eq!(job.schema.source_arity(), 21);
        assert!(job.schema.is_refreshable("points"));
        assert!(!job.schema.is_refreshable("user_id"));
    }

    #[test]
    fn job_postings_refresh_every_non_key_column() {
        let job = job_postings_job();
        assert_eq!(job.schema.columns.len(), 25);
        assert_eq!(job.schema.refreshable.len(), 24);
        assert_eq!(job.source, SourceConnection::JobPosting);
        assert_eq!(job.schema.immutable_columns().count(), 0);
    }

    #[test]
    fn lookup_by_name() {
        assert!(job_by_name("topics").is_some());
        assert!(job_by_name("nope").is_none());
        assert_eq!(job_names().first(), Some(&"assignment_question"));
    }
}
