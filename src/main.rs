use actix_cors::Cors;
use actix_web::{delete, get, post, put, web, App, HttpResponse, HttpServer};
use mongodb::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use fairshare::cache::{self, ReadCache};
use fairshare::config::Config;
use fairshare::error::{AppError, AppResult};
use fairshare::invite;
use fairshare::mail::Mailer;
use fairshare::mutation::Coordinator;
use fairshare::schemas::{new_id, Expense, ExpensePayload, Friend, NewFriend, NewProfile, Profile};
use fairshare::store::Store;

#[post("/users")]
async fn register_user(
    store: web::Data<Store>,
    read_cache: web::Data<ReadCache>,
    mailer: web::Data<Mailer>,
    json: web::Json<NewProfile>,
) -> AppResult<HttpResponse> {
    let payload = json.into_inner();
    payload.validate()?;
    if store.profile_by_email(&payload.email).await?.is_some() {
        return Err(AppError::AlreadyExists {
            entity: "profile",
            id: payload.email,
        });
    }

    let profile = Profile {
        id: new_id(),
        name: payload.name,
        email: payload.email,
    };
    store.insert_profile(&profile).await?;
    invite::link_pending_invitations(&store, &read_cache, &profile).await?;

    if let Err(err) = mailer.send_welcome(&profile.email, &profile.name).await {
        warn!(%err, "welcome email not sent");
    }
    Ok(HttpResponse::Created().json(profile))
}

#[get("/users/{user_id}/friends")]
async fn list_friends(
    store: web::Data<Store>,
    read_cache: web::Data<ReadCache>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let user_id = path.into_inner();
    let key = cache::friends_key(&user_id);
    if let Some(friends) = read_cache.get::<Vec<Friend>>(&key).await {
        return Ok(HttpResponse::Ok().json(friends));
    }
    let friends = store.friends_of(&user_id).await?;
    read_cache.put(&key, &friends).await;
    Ok(HttpResponse::Ok().json(friends))
}

#[post("/users/{user_id}/friends")]
async fn add_friend(
    store: web::Data<Store>,
    read_cache: web::Data<ReadCache>,
    mailer: web::Data<Mailer>,
    config: web::Data<Config>,
    path: web::Path<String>,
    json: web::Json<NewFriend>,
) -> AppResult<HttpResponse> {
    let user_id = path.into_inner();
    let payload = json.into_inner();
    payload.validate()?;
    let owner = store.profile(&user_id).await?;

    let counterparty = match &payload.email {
        Some(email) => store.profile_by_email(email).await?,
        None => None,
    };

    let friend = match counterparty {
        // The invited email already has a profile: create both sides of the
        // ledger linked from the start.
        Some(counterparty) => {
            let owner_side = Friend {
                id: new_id(),
                user_id: owner.id.clone(),
                name: payload.name,
                email: payload.email.clone(),
                phone: payload.phone,
                balance: 0.0,
                registered_user_id: Some(counterparty.id.clone()),
            };
            let reciprocal = Friend {
                id: new_id(),
                user_id: counterparty.id.clone(),
                name: owner.name.clone(),
                email: Some(owner.email.clone()),
                phone: None,
                balance: 0.0,
                registered_user_id: Some(owner.id.clone()),
            };
            store.insert_linked_friends(&owner_side, &reciprocal).await?;
            read_cache
                .invalidate(&cache::friends_key(&counterparty.id))
                .await;
            owner_side
        }
        // Unregistered contact: a pending one-sided ledger, invited by email
        // when we have one.
        None => {
            let friend = Friend {
                id: new_id(),
                user_id: owner.id.clone(),
                name: payload.name,
                email: payload.email.clone(),
                phone: payload.phone,
                balance: 0.0,
                registered_user_id: None,
            };
            store.insert_friend(&friend).await?;
            if let Some(email) = &payload.email {
                let token = invite::invite_token(&config.invite_secret, &friend.id, email);
                if let Err(err) = mailer
                    .send_invitation(email, &owner.name, &friend.id, &token)
                    .await
                {
                    warn!(%err, friend_id = %friend.id, "invitation email not sent");
                }
            }
            friend
        }
    };

    read_cache.invalidate(&cache::friends_key(&owner.id)).await;
    Ok(HttpResponse::Created().json(friend))
}

#[post("/users/{user_id}/friends/{friend_id}/resend-invitation")]
async fn resend_invitation(
    store: web::Data<Store>,
    mailer: web::Data<Mailer>,
    config: web::Data<Config>,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (user_id, friend_id) = path.into_inner();
    let friend = owned_friend(&store, &user_id, &friend_id).await?;
    if friend.registered_user_id.is_some() {
        return Err(AppError::InvitationNotPending(friend_id));
    }
    let email = friend.email.ok_or(AppError::MissingField("email"))?;
    let owner = store.profile(&user_id).await?;
    let token = invite::invite_token(&config.invite_secret, &friend.id, &email);
    mailer
        .send_invitation(&email, &owner.name, &friend.id, &token)
        .await?;
    Ok(HttpResponse::Ok().finish())
}

#[derive(Deserialize)]
struct JoinQuery {
    friend: String,
    email: String,
    token: String,
}

/// Resolve an invitation link: check the token against the invited identity
/// and report who sent the invitation, so a client can prefill registration
/// with the matching email.
#[get("/join")]
async fn join_invitation(
    store: web::Data<Store>,
    config: web::Data<Config>,
    query: web::Query<JoinQuery>,
) -> AppResult<HttpResponse> {
    let query = query.into_inner();
    if !invite::verify_invite_token(&config.invite_secret, &query.friend, &query.email, &query.token)
    {
        return Err(AppError::not_found("invitation", &query.friend));
    }
    let friend = store.friend(&query.friend).await?;
    if friend.registered_user_id.is_some() {
        return Err(AppError::InvitationNotPending(query.friend));
    }
    let owner = store.profile(&friend.user_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "inviter": owner.name,
        "email": query.email,
    })))
}

#[get("/users/{user_id}/friends/{friend_id}/expenses")]
async fn list_expenses(
    store: web::Data<Store>,
    read_cache: web::Data<ReadCache>,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (user_id, friend_id) = path.into_inner();
    owned_friend(&store, &user_id, &friend_id).await?;
    let key = cache::expenses_key(&user_id, &friend_id);
    if let Some(expenses) = read_cache.get::<Vec<Expense>>(&key).await {
        return Ok(HttpResponse::Ok().json(expenses));
    }
    let expenses = store.expenses_of(&friend_id).await?;
    read_cache.put(&key, &expenses).await;
    Ok(HttpResponse::Ok().json(expenses))
}

#[post("/users/{user_id}/friends/{friend_id}/expenses")]
async fn add_expense(
    store: web::Data<Store>,
    coordinator: web::Data<Coordinator>,
    path: web::Path<(String, String)>,
    json: web::Json<ExpensePayload>,
) -> AppResult<HttpResponse> {
    let (user_id, friend_id) = path.into_inner();
    owned_friend(&store, &user_id, &friend_id).await?;
    let expense = coordinator.add_expense(&friend_id, &json.into_inner()).await?;
    Ok(HttpResponse::Created().json(expense))
}

#[put("/expenses/{expense_id}")]
async fn edit_expense(
    coordinator: web::Data<Coordinator>,
    path: web::Path<String>,
    json: web::Json<ExpensePayload>,
) -> AppResult<HttpResponse> {
    let expense = coordinator
        .edit_expense(&path.into_inner(), &json.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(expense))
}

#[delete("/expenses/{expense_id}")]
async fn delete_expense(
    coordinator: web::Data<Coordinator>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    coordinator.delete_expense(&path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[get("/users/{user_id}/friends/{friend_id}")]
async fn get_friend(
    store: web::Data<Store>,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (user_id, friend_id) = path.into_inner();
    let friend = owned_friend(&store, &user_id, &friend_id).await?;
    Ok(HttpResponse::Ok().json(friend))
}

/// Load a friend and check it belongs to the user in the path. Records owned
/// by someone else are reported as not found, not as forbidden.
async fn owned_friend(store: &Store, user_id: &str, friend_id: &str) -> AppResult<Friend> {
    let friend = store.friend(friend_id).await?;
    if friend.user_id != user_id {
        return Err(AppError::not_found("friend", friend_id));
    }
    Ok(friend)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().expect("invalid configuration");
    tracing::info!(uri = %config.mongodb_uri, db = %config.database, "connecting");

    let client = Client::with_uri_str(&config.mongodb_uri)
        .await
        .expect("failed to connect");
    let store = Store::new(client, &config.database);
    let read_cache = ReadCache::new();
    let mailer = Mailer::new(config.smtp.as_ref(), config.base_url.clone())
        .expect("failed to build mailer");
    let coordinator = Coordinator::new(store.clone(), read_cache.clone());
    let bind_addr = config.bind_addr.clone();
    tracing::info!(%bind_addr, "listening");

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(web::Data::new(store.clone()))
            .app_data(web::Data::new(read_cache.clone()))
            .app_data(web::Data::new(mailer.clone()))
            .app_data(web::Data::new(coordinator.clone()))
            .app_data(web::Data::new(config.clone()))
            .service(register_user)
            .service(list_friends)
            .service(add_friend)
            .service(get_friend)
            .service(resend_invitation)
            .service(join_invitation)
            .service(list_expenses)
            .service(add_expense)
            .service(edit_expense)
            .service(delete_expense)
    })
    .bind(bind_addr)?
    .run()
    .await
}
