//! Diesel table definitions for the preview controller.
//!
//! Tables: preview_environments, preview_deployments, preview_deployment_revisions.

diesel::table! {
    preview_environments (id) {
        id -> Int8,
        project_id -> Int8,
        cluster_id -> Int8,
        git_installation_id -> Int8,
        git_repo_owner -> Varchar,
        git_repo_name -> Varchar,
        name -> Varchar,
        mode -> Varchar,
        git_repo_branches -> Array<Text>,
        git_deploy_branches -> Array<Text>,
        new_comments_disabled -> Bool,
        namespace_labels -> Jsonb,
        webhook_uid -> Varchar,
        github_webhook_id -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    preview_deployments (id) {
        id -> Int8,
        environment_id -> Int8,
        namespace -> Varchar,
        status -> Varchar,
        subdomain -> Nullable<Varchar>,
        pull_request_id -> Int8,
        pr_branch_from -> Varchar,
        gh_deployment_id -> Int8,
        gh_pr_comment_id -> Int8,
        last_errors -> Text,
        pr_name -> Varchar,
        commit_sha -> Varchar,
        pr_branch_into -> Varchar,
        gh_repo_owner -> Varchar,
        gh_repo_name -> Varchar,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    preview_deployment_revisions (id) {
        id -> Int8,
        deployment_id -> Int8,
        revision -> Int4,
        status -> Varchar,
        commit_sha -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(preview_deployments -> preview_environments (environment_id));
diesel::joinable!(preview_deployment_revisions -> preview_deployments (deployment_id));

diesel::allow_tables_to_appear_in_same_query!(
    preview_environments,
    preview_deployments,
    preview_deployment_revisions,
);
