//! Demo scenarios exercising the engine end to end.

use std::time::Duration;

use miette::Result;
use quarry_core::{
    CallContext, Engine, EngineBuilder, EngineConfig, EventCounter, FetchBaseQuery, MutationDefinition,
    MutationOptions, QueryDefinition, QueryError, SubscriptionOptions, TracingModule,
};
use serde_json::{Value, json};
use tracing::info;

use crate::server::{DemoServer, Post};

fn engine_error(e: impl std::fmt::Display) -> miette::Report {
    miette::miette!("{}", e)
}

fn builder(config: EngineConfig) -> EngineBuilder {
    Engine::builder()
        .config(config)
        .module(TracingModule)
        .module(EventCounter::new())
}

/// Two concurrent readers share one request; each increment invalidates the
/// `Counter` tag and the subscribed count is refetched.
pub async fn counter(config: EngineConfig, latency: Duration, increments: u32) -> Result<Value> {
    let engine = builder(config)
        .base_query(DemoServer::new(latency))
        .query(
            "getCount",
            QueryDefinition::new()
                .request(|_| json!("/count"))
                .provides(vec!["Counter"]),
        )
        .mutation(
            "increment",
            MutationDefinition::new()
                .request(|by| json!({ "url": "/count/increment", "method": "POST", "body": { "by": by } }))
                .invalidates(vec!["Counter"]),
        )
        .build()
        .map_err(engine_error)?;

    let first = engine
        .initiate_query("getCount", (), SubscriptionOptions::default())
        .await
        .map_err(engine_error)?;
    let second = engine
        .initiate_query("getCount", (), SubscriptionOptions::default())
        .await
        .map_err(engine_error)?;
    info!(
        key = %first.cache_key(),
        shared = first.request_id() == second.request_id(),
        "two subscribers mounted"
    );
    let count = first.result().await.map_err(engine_error)?;
    println!("initial: {count}");

    for _ in 0..increments {
        let mutation = engine
            .initiate_mutation("increment", 1, MutationOptions::default())
            .await
            .map_err(engine_error)?;
        let written = mutation.result().await.map_err(engine_error)?;
        let refetched = engine
            .wait_for_query("getCount", ())
            .await
            .map_err(engine_error)?;
        let cached = match refetched {
            Some(outcome) => outcome.map_err(engine_error)?,
            None => engine
                .query_state("getCount", ())
                .await
                .map_err(engine_error)?
                .and_then(|entry| entry.data)
                .unwrap_or(Value::Null),
        };
        println!("increment -> {written}, cached {cached}");
        mutation.unsubscribe().await;
    }

    finish(&engine).await
}

/// Rename a post optimistically against a server that rejects writes, then
/// watch the cache roll back.
pub async fn posts(config: EngineConfig, latency: Duration, title: String) -> Result<Value> {
    let server = DemoServer::new(latency)
        .with_posts([
            Post {
                id: 1,
                title: "Hello".into(),
            },
            Post {
                id: 2,
                title: "Second".into(),
            },
        ])
        .failing_writes();

    let engine = builder(config)
        .base_query(server)
        .query(
            "getPosts",
            QueryDefinition::new().request(|_| json!("/posts")).provides(vec!["Post"]),
        )
        .mutation(
            "renamePost",
            MutationDefinition::new()
                .request(|args| {
                    json!({
                        "url": format!("/posts/{}", args["id"]),
                        "method": "PATCH",
                        "body": { "title": args["title"] },
                    })
                })
                .on_start(rename_optimistically)
                .on_error(|ctx: CallContext, error: QueryError| async move {
                    info!(error = %error, "rename failed, rolling back");
                    ctx.undo_patches().await;
                })
                .invalidates(vec!["Post"]),
        )
        .build()
        .map_err(engine_error)?;

    let list = engine
        .initiate_query("getPosts", (), SubscriptionOptions::default())
        .await
        .map_err(engine_error)?;
    println!("before: {}", list.result().await.map_err(engine_error)?);

    let rename = engine
        .initiate_mutation("renamePost", json!({ "id": 1, "title": title }), MutationOptions::default())
        .await
        .map_err(engine_error)?;
    // on_start has run by the time the transport sees the request.
    tokio::time::sleep(latency / 2).await;
    if let Some(entry) = list.state().await {
        println!("optimistic: {}", entry.data.unwrap_or(Value::Null));
    }

    match rename.result().await {
        Ok(post) => println!("renamed: {post}"),
        Err(e) => println!("rename rejected: {e}"),
    }
    if let Some(entry) = list.state().await {
        println!("after: {}", entry.data.unwrap_or(Value::Null));
    }

    finish(&engine).await
}

async fn rename_optimistically(ctx: CallContext) {
    let id = ctx.args()["id"].clone();
    let title = ctx.args()["title"].clone();
    let update = ctx
        .engine()
        .update_query_result("getPosts", (), move |posts| {
            if let Some(post) = posts
                .as_array_mut()
                .and_then(|posts| posts.iter_mut().find(|p| p["id"] == id))
            {
                post["title"] = title;
            }
        })
        .await;
    match update {
        Ok(patches) => ctx.keep_patch(patches),
        Err(e) => info!(error = %e, "optimistic update skipped"),
    }
}

/// Fetch a path over HTTP with two subscribers, then hit the cache.
pub async fn fetch(config: EngineConfig, base_url: String, path: String) -> Result<Value> {
    let engine = builder(config)
        .base_query(FetchBaseQuery::new(base_url).default_header("user-agent", "quarry"))
        .query("get", QueryDefinition::new().request(|path| path.clone()))
        .build()
        .map_err(engine_error)?;

    let first = engine
        .initiate_query("get", &path, SubscriptionOptions::default())
        .await
        .map_err(engine_error)?;
    let second = engine
        .initiate_query("get", &path, SubscriptionOptions::default())
        .await
        .map_err(engine_error)?;
    info!(shared = first.request_id() == second.request_id(), "two subscribers mounted");

    match first.result().await {
        Ok(body) => println!("{}", serde_json::to_string_pretty(&body).map_err(engine_error)?),
        Err(QueryError::Transport(error)) => println!("transport error: {error}"),
        Err(e) => return Err(engine_error(e)),
    }

    let cached = engine
        .initiate_query("get", &path, SubscriptionOptions::default())
        .await
        .map_err(engine_error)?;
    info!(cache_hit = cached.request_id().is_none(), "third subscriber mounted");

    finish(&engine).await
}

/// Tear down and return a snapshot with per-kind event counts.
async fn finish(engine: &Engine) -> Result<Value> {
    engine.teardown().await;
    let mut snapshot = serde_json::to_value(engine.snapshot().await).map_err(engine_error)?;
    if let Some(counter) = engine.module::<EventCounter>() {
        snapshot["events"] = json!(counter.counts());
    }
    Ok(snapshot)
}
