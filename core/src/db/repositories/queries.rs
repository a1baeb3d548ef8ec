// SQL query constants for repositories
// Centralizes repeated SELECT column lists

/// SQL query fragments for the job_detail table
pub mod job_detail_queries {
    pub const SELECT_ALL_COLUMNS: &str = r#"id, name, pool, source, class,
        COALESCE(args, 'null'::jsonb) AS args,
        priority, expression, next_fire_time, pre_fire_time,
        misfire_threshold, misfire_policy, status,
        deleted, deleted_time, created_time, updated_time"#;
}

/// SQL query fragments for the job_fired table
pub mod job_fired_queries {
    pub const SELECT_ALL_COLUMNS: &str =
        "id, job_detail_id, fired_time, status, created_time, updated_time";

    /// Same columns qualified with the `f` alias used in joins
    pub const SELECT_ALL_COLUMNS_QUALIFIED: &str =
        "f.id, f.job_detail_id, f.fired_time, f.status, f.created_time, f.updated_time";
}
