use axum::{
    Router,
    middleware as axum_middleware,
    routing::{delete, get, patch, post, put},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use lumen::config::Config;
use lumen::db;
use lumen::services::app_settings::AppSettingsService;
use lumen::services::feed_ingestion::IngestionService;
use lumen::services::scheduler::Scheduler;
use lumen::services::suggestions::SuggestionService;
use lumen::services::summarizer::{ApiKeyRotator, CircuitBreaker, SummarizerClient};
use lumen::services::summary_worker::SummaryWorker;
use lumen::services::user_profile::UserProfileService;
use lumen::utils::JwtUtil;
use lumen::{AppState, handlers, middleware};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::auth::login,
        handlers::auth::logout,
        handlers::auth::me,

        handlers::categories::list_categories,
        handlers::categories::create_category,
        handlers::categories::update_category,
        handlers::categories::delete_category,
        handlers::categories::reorder_categories,

        handlers::feeds::list_feeds,
        handlers::feeds::create_feed,
        handlers::feeds::update_feed,
        handlers::feeds::delete_feed,
        handlers::feeds::refresh_feed,
        handlers::feeds::enable_feed,
        handlers::feeds::discover_feeds,
        handlers::feeds::import_opml,
        handlers::feeds::export_opml,

        handlers::posts::list_posts,
        handlers::posts::get_post,
        handlers::posts::set_read,
        handlers::posts::set_starred,
        handlers::posts::set_liked,
        handlers::posts::mark_read_batch,
        handlers::posts::redirect_to_post,
        handlers::posts::regenerate_summary,
        handlers::posts::get_full_content,

        handlers::preferences::get_preferences,
        handlers::preferences::update_preferences,

        handlers::proxy::proxy_image,

        handlers::admin::get_status,
        handlers::admin::get_queue_status,
        handlers::admin::reprocess_summary,
        handlers::admin::clear_queue_cooldowns,
        handlers::admin::vacuum,
        handlers::admin::get_config,

        handlers::suggestions::get_status,
        handlers::suggestions::regenerate_profile,
        handlers::suggestions::process_suggestions,
    ),
    components(
        schemas(
            lumen::models::Category,
            lumen::models::CreateCategoryRequest,
            lumen::models::UpdateCategoryRequest,
            lumen::models::ReorderCategoriesRequest,
            lumen::models::Feed,
            lumen::models::CreateFeedRequest,
            lumen::models::UpdateFeedRequest,
            lumen::models::FeedResponse,
            lumen::models::DiscoveredFeed,
            lumen::models::Post,
            lumen::models::PostTag,
            lumen::models::PostListResponse,
            lumen::models::PostDetailResponse,
            lumen::models::FeedUnreadCount,
            lumen::models::MarkReadRequest,
            lumen::models::SetFlagRequest,
            lumen::models::AiSummary,
            lumen::models::SummaryQueueEntry,
            lumen::models::SummaryFailure,
            lumen::models::CleanupLog,
            handlers::auth::LoginRequest,
            handlers::auth::LoginResponse,
            handlers::auth::MeResponse,
            handlers::feeds::RefreshResponse,
            handlers::feeds::ImportOpmlResponse,
            handlers::preferences::PreferencesResponse,
            handlers::preferences::UpdatePreferencesRequest,
            handlers::admin::StatusResponse,
            handlers::admin::QueueStatusResponse,
            handlers::admin::ReprocessRequest,
            handlers::admin::PublicConfigResponse,
            handlers::suggestions::RegenerateProfileResponse,
            handlers::suggestions::ProcessSuggestionsResponse,
            lumen::services::SuggestionStats,
            lumen::services::UserProfile,
            lumen::services::summarizer::RotatorStatus,
            lumen::services::summarizer::KeyStatus,
            lumen::services::summarizer::CircuitStatus,
            lumen::services::summarizer::CircuitState,
        )
    ),
    tags(
        (name = "Authentication", description = "Session management"),
        (name = "Categories", description = "Category management"),
        (name = "Feeds", description = "Feed subscriptions"),
        (name = "Posts", description = "Post reading and flags"),
        (name = "Preferences", description = "User preferences"),
        (name = "Proxy", description = "Image proxy"),
        (name = "Admin", description = "Operational endpoints"),
        (name = "Suggestions", description = "Personalized suggestions"),
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.as_mut().unwrap();
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(utoipa::openapi::security::Http::new(
                utoipa::openapi::security::HttpAuthScheme::Bearer,
            )),
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    // The appender guard must outlive main or file logging stops
    let mut _appender_guard = None;
    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("lumen.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _appender_guard = Some(guard);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Lumen starting up");

    let pool = db::create_pool(&config.database.path).await?;
    db::run_migrations(&pool).await?;
    // A corrupt store must not serve; bail out before anything touches it
    db::verify_integrity(&pool, &config.database.path).await?;
    tracing::info!("Database ready");

    let jwt_util = Arc::new(JwtUtil::new(
        &config.auth.session_secret,
        config.auth.token_expiration_hours,
    ));

    let settings = AppSettingsService::new(pool.clone());

    let rotator =
        Arc::new(ApiKeyRotator::new(pool.clone(), config.llm.api_key_list()).await);
    let circuit = Arc::new(
        CircuitBreaker::new(
            pool.clone(),
            config.llm.failure_threshold,
            config.llm.recovery_timeout_secs,
            config.llm.half_open_max_requests,
            config.llm.max_rpm,
        )
        .await,
    );
    let summarizer = Arc::new(SummarizerClient::new(
        config.llm.clone(),
        settings.clone(),
        Arc::clone(&rotator),
        Arc::clone(&circuit),
    ));
    tracing::info!(
        "Summarizer initialized ({} API keys configured)",
        rotator.key_count()
    );

    let ingestion = Arc::new(IngestionService::new(pool.clone()));
    let worker = Arc::new(SummaryWorker::new(
        pool.clone(),
        Arc::clone(&summarizer),
        config.jobs.summary_lock_timeout_seconds,
    ));
    let profile_service = UserProfileService::new(
        pool.clone(),
        settings.clone(),
        Arc::clone(&summarizer),
        config.llm.prompts_path.clone(),
    );
    let suggestion_service = SuggestionService::new(
        pool.clone(),
        profile_service.clone(),
        Arc::clone(&summarizer),
        config.llm.prompts_path.clone(),
    );

    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        config.clone(),
        Arc::clone(&ingestion),
        Arc::clone(&worker),
        settings.clone(),
        profile_service.clone(),
        suggestion_service.clone(),
    ));

    let app_state = Arc::new(AppState {
        db: pool.clone(),
        config: config.clone(),
        jwt_util: Arc::clone(&jwt_util),
        settings,
        ingestion,
        summarizer,
        worker,
        profile_service,
        suggestion_service,
        scheduler: Arc::clone(&scheduler),
    });

    scheduler.start().await;
    tracing::info!(
        "Scheduler started (leader: {}, instance: {})",
        scheduler.is_leader(),
        scheduler.instance_id()
    );

    let auth_state = middleware::AuthState { jwt_util: Arc::clone(&jwt_util), db: pool.clone() };

    let public_routes = Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .with_state(Arc::clone(&app_state));

    let protected_routes = Router::new()
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/auth/me", get(handlers::auth::me))
        .route(
            "/api/categories",
            get(handlers::categories::list_categories).post(handlers::categories::create_category),
        )
        .route("/api/categories/reorder", put(handlers::categories::reorder_categories))
        .route(
            "/api/categories/:id",
            put(handlers::categories::update_category)
                .delete(handlers::categories::delete_category),
        )
        .route("/api/feeds", get(handlers::feeds::list_feeds).post(handlers::feeds::create_feed))
        .route("/api/feeds/discover", post(handlers::feeds::discover_feeds))
        .route("/api/feeds/import-opml", post(handlers::feeds::import_opml))
        .route("/api/feeds/export-opml", get(handlers::feeds::export_opml))
        .route(
            "/api/feeds/:id",
            put(handlers::feeds::update_feed).delete(handlers::feeds::delete_feed),
        )
        .route("/api/feeds/:id/refresh", post(handlers::feeds::refresh_feed))
        .route("/api/feeds/:id/enable", post(handlers::feeds::enable_feed))
        .route("/api/posts", get(handlers::posts::list_posts))
        .route("/api/posts/mark-read", post(handlers::posts::mark_read_batch))
        .route("/api/posts/:id", get(handlers::posts::get_post))
        .route("/api/posts/:id/read", patch(handlers::posts::set_read))
        .route("/api/posts/:id/star", patch(handlers::posts::set_starred))
        .route("/api/posts/:id/like", patch(handlers::posts::set_liked))
        .route("/api/posts/:id/redirect", get(handlers::posts::redirect_to_post))
        .route("/api/posts/:id/regenerate-summary", post(handlers::posts::regenerate_summary))
        .route("/api/posts/:id/full-content", get(handlers::posts::get_full_content))
        .route(
            "/api/preferences",
            get(handlers::preferences::get_preferences)
                .put(handlers::preferences::update_preferences),
        )
        .route("/api/proxy/image", get(handlers::proxy::proxy_image))
        .route("/api/admin/status", get(handlers::admin::get_status))
        .route("/api/admin/queue-status", get(handlers::admin::get_queue_status))
        .route("/api/admin/reprocess-summary", post(handlers::admin::reprocess_summary))
        .route("/api/admin/clear-queue-cooldowns", post(handlers::admin::clear_queue_cooldowns))
        .route("/api/admin/vacuum", post(handlers::admin::vacuum))
        .route("/api/admin/config", get(handlers::admin::get_config))
        .route("/api/suggestions/status", get(handlers::suggestions::get_status))
        .route(
            "/api/suggestions/admin/regenerate-profile",
            post(handlers::suggestions::regenerate_profile),
        )
        .route(
            "/api/suggestions/admin/process-suggestions",
            post(handlers::suggestions::process_suggestions),
        )
        .with_state(Arc::clone(&app_state))
        .layer(axum_middleware::from_fn_with_state(auth_state, middleware::auth_middleware));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check));

    let app = Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public_routes)
        .merge(protected_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(build_cors_layer(&config.cors.origins));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    tracing::info!("Lumen stopped");

    Ok(())
}

fn build_cors_layer(origins: &str) -> tower_http::cors::CorsLayer {
    if origins.trim() == "*" {
        return tower_http::cors::CorsLayer::permissive();
    }

    let parsed: Vec<_> = origins
        .split(',')
        .filter_map(|o| o.trim().parse::<axum::http::HeaderValue>().ok())
        .collect();

    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(parsed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}
