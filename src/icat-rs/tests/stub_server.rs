//! Integration tests against an in-process stub of the ICAT REST API.
//!
//! The stub implements just enough of the server contract to exercise the
//! client end to end: session issue/refresh/expiry, the entity manager,
//! the port (export/import) routes and the error envelope.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer};
use icat_rs::{AttributeScope, DataSearch, DuplicateAction, ErrorKind, Icat};

#[derive(Default)]
struct Stub {
    sessions: Mutex<HashMap<String, SessionInfo>>,
    facilities: Mutex<Vec<(i64, String)>>,
    imported: Mutex<Option<String>>,
    next_id: AtomicUsize,
    entity_manager_hits: AtomicUsize,
}

struct SessionInfo {
    user_name: String,
    remaining_minutes: f64,
}

fn envelope(status: StatusCode, code: &str, message: &str, offset: Option<i32>) -> HttpResponse {
    let mut body = serde_json::json!({ "code": code, "message": message });
    if let Some(offset) = offset {
        body["offset"] = offset.into();
    }
    HttpResponse::build(status).json(body)
}

fn session_error() -> HttpResponse {
    envelope(
        StatusCode::FORBIDDEN,
        "SESSION",
        "Unable to find user by sessionid",
        None,
    )
}

impl Stub {
    fn check_session(&self, session_id: Option<&String>) -> Result<(), HttpResponse> {
        match session_id {
            Some(id) if self.sessions.lock().unwrap().contains_key(id) => Ok(()),
            _ => Err(session_error()),
        }
    }
}

async fn login(stub: web::Data<Stub>, form: web::Form<HashMap<String, String>>) -> HttpResponse {
    let Some(arg) = form.get("json") else {
        return envelope(StatusCode::BAD_REQUEST, "BAD_PARAMETER", "json is not set", None);
    };
    let parsed: serde_json::Value = match serde_json::from_str(arg) {
        Ok(v) => v,
        Err(e) => {
            return envelope(StatusCode::BAD_REQUEST, "BAD_PARAMETER", &e.to_string(), None)
        }
    };
    let plugin = parsed["plugin"].as_str().unwrap_or_default().to_string();
    let mut username = String::new();
    for entry in parsed["credentials"].as_array().cloned().unwrap_or_default() {
        if let Some(value) = entry.get("username") {
            username = value.as_str().unwrap_or_default().to_string();
        }
    }
    let id = format!("sid-{}", stub.next_id.fetch_add(1, Ordering::SeqCst));
    stub.sessions.lock().unwrap().insert(
        id.clone(),
        SessionInfo {
            user_name: format!("{plugin}/{username}"),
            remaining_minutes: 119.5,
        },
    );
    HttpResponse::Ok().json(serde_json::json!({ "sessionId": id }))
}

async fn get_session(stub: web::Data<Stub>, path: web::Path<String>) -> HttpResponse {
    let sessions = stub.sessions.lock().unwrap();
    match sessions.get(&path.into_inner()) {
        Some(info) => HttpResponse::Ok().json(serde_json::json!({
            "userName": info.user_name,
            "remainingMinutes": info.remaining_minutes,
        })),
        None => session_error(),
    }
}

async fn refresh_session(stub: web::Data<Stub>, path: web::Path<String>) -> HttpResponse {
    let mut sessions = stub.sessions.lock().unwrap();
    match sessions.get_mut(&path.into_inner()) {
        Some(info) => {
            info.remaining_minutes = 120.0;
            HttpResponse::NoContent().finish()
        }
        None => session_error(),
    }
}

async fn logout(stub: web::Data<Stub>, path: web::Path<String>) -> HttpResponse {
    match stub.sessions.lock().unwrap().remove(&path.into_inner()) {
        Some(_) => HttpResponse::NoContent().finish(),
        None => session_error(),
    }
}

async fn is_logged_in(stub: web::Data<Stub>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();
    let logged_in = stub
        .sessions
        .lock()
        .unwrap()
        .values()
        .any(|info| info.user_name == name);
    HttpResponse::Ok().json(serde_json::json!({ "loggedIn": logged_in }))
}

async fn write_entities(
    stub: web::Data<Stub>,
    form: web::Form<HashMap<String, String>>,
) -> HttpResponse {
    if let Err(resp) = stub.check_session(form.get("sessionId")) {
        return resp;
    }
    let entities: serde_json::Value =
        serde_json::from_str(form.get("entities").map(String::as_str).unwrap_or("")).unwrap();
    let name = entities["Facility"]["name"].as_str().unwrap().to_string();
    let id = 17 + stub.next_id.fetch_add(1, Ordering::SeqCst) as i64;
    stub.facilities.lock().unwrap().push((id, name));
    HttpResponse::Ok().json(serde_json::json!([id]))
}

async fn query_entities(
    stub: web::Data<Stub>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    stub.entity_manager_hits.fetch_add(1, Ordering::SeqCst);
    if let Err(resp) = stub.check_session(query.get("sessionId")) {
        return resp;
    }
    let facilities = stub.facilities.lock().unwrap();
    if let Some(id) = query.get("id") {
        let id: i64 = id.parse().unwrap();
        match facilities.iter().find(|(fid, _)| *fid == id) {
            Some((id, name)) => HttpResponse::Ok()
                .json(serde_json::json!({ "Facility": { "id": id, "name": name } })),
            None => envelope(
                StatusCode::NOT_FOUND,
                "NO_SUCH_OBJECT_FOUND",
                "Facility not found",
                None,
            ),
        }
    } else {
        let ids: Vec<i64> = facilities.iter().map(|(id, _)| *id).collect();
        HttpResponse::Ok().json(ids)
    }
}

async fn delete_entities(
    stub: web::Data<Stub>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    if let Err(resp) = stub.check_session(query.get("sessionId")) {
        return resp;
    }
    if query.get("entities").is_some_and(|e| e.contains("Rule")) {
        return envelope(
            StatusCode::FORBIDDEN,
            "INSUFFICIENT_PRIVILEGES",
            "Rules may only be deleted by root",
            Some(42),
        );
    }
    HttpResponse::NoContent().finish()
}

async fn export_port(
    stub: web::Data<Stub>,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let arg: serde_json::Value =
        serde_json::from_str(query.get("json").map(String::as_str).unwrap_or("{}")).unwrap();
    let session_id = arg["sessionId"].as_str().unwrap_or_default().to_string();
    if let Err(resp) = stub.check_session(Some(&session_id)) {
        return resp;
    }
    let mut out = String::from("# Version of file format\n1.0\n\nFacility(name:0)\n");
    for (_, name) in stub.facilities.lock().unwrap().iter() {
        out.push_str(&format!("\"{name}\"\n"));
    }
    HttpResponse::Ok().body(out)
}

async fn import_port(stub: web::Data<Stub>, body: web::Bytes) -> HttpResponse {
    // Crude multipart scan, good enough for a stub: the file part is the
    // payload between its blank line and the closing boundary
    let text = String::from_utf8_lossy(&body);
    let Some(file_at) = text.find("name=\"file\"") else {
        return envelope(StatusCode::BAD_REQUEST, "BAD_PARAMETER", "No file part", None);
    };
    let Some(start) = text[file_at..].find("\r\n\r\n").map(|i| file_at + i + 4) else {
        return envelope(StatusCode::BAD_REQUEST, "BAD_PARAMETER", "Bad file part", None);
    };
    let end = text[start..]
        .find("\r\n--")
        .map(|i| start + i)
        .unwrap_or(text.len());
    *stub.imported.lock().unwrap() = Some(text[start..end].to_string());
    HttpResponse::NoContent().finish()
}

async fn search_documents(query: web::Query<HashMap<String, String>>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "received": query.get("query"),
        "maxCount": query.get("maxCount"),
        "results": [],
    }))
}

async fn lucene_populating(query: web::Query<HashMap<String, String>>) -> HttpResponse {
    if query.get("sessionId").is_none() {
        return session_error();
    }
    HttpResponse::Ok().json(serde_json::json!(["Dataset", "Datafile"]))
}

async fn version() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "version": "5.0.0" }))
}

async fn wait_millis() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

async fn spawn_stub() -> (String, web::Data<Stub>) {
    let stub = web::Data::new(Stub::default());
    let state = stub.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/icat/session", web::post().to(login))
            .route("/icat/session/{id}", web::get().to(get_session))
            .route("/icat/session/{id}", web::put().to(refresh_session))
            .route("/icat/session/{id}", web::delete().to(logout))
            .route("/icat/user/{name:.*}", web::get().to(is_logged_in))
            .route("/icat/entityManager", web::post().to(write_entities))
            .route("/icat/entityManager", web::get().to(query_entities))
            .route("/icat/entityManager", web::delete().to(delete_entities))
            .route("/icat/port", web::get().to(export_port))
            .route("/icat/port", web::post().to(import_port))
            .route("/icat/search/documents", web::get().to(search_documents))
            .route("/icat/lucene/db", web::get().to(lucene_populating))
            .route("/icat/version", web::get().to(version))
            .route("/icat/waitMillis", web::post().to(wait_millis))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    (format!("http://{addr}"), stub)
}

fn credentials(username: &str, password: &str) -> HashMap<String, String> {
    HashMap::from([
        ("username".to_string(), username.to_string()),
        ("password".to_string(), password.to_string()),
    ])
}

#[actix_web::test]
async fn test_session_lifecycle() {
    let (url, _stub) = spawn_stub().await;
    let icat = Icat::new(&url).unwrap();

    assert!(!icat.is_logged_in("db/root").await.unwrap());
    let session = icat
        .login("db", &credentials("root", "password"))
        .await
        .unwrap();
    assert_eq!(session.get_user_name().await.unwrap(), "db/root");
    assert!(icat.is_logged_in("db/root").await.unwrap());

    let before = session.get_remaining_minutes().await.unwrap();
    assert!(before > 119.0 && before < 120.0);
    session.refresh().await.unwrap();
    let after = session.get_remaining_minutes().await.unwrap();
    assert!(after > before);

    session.logout().await.unwrap();
    let err = session.get_remaining_minutes().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Session);
    let err = session.logout().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Session);
}

#[actix_web::test]
async fn test_write_then_get() {
    let (url, _stub) = spawn_stub().await;
    let icat = Icat::new(&url).unwrap();
    let session = icat
        .login("db", &credentials("root", "password"))
        .await
        .unwrap();

    let ids = session
        .write(r#"{"Facility":{"name":"Test Facility"}}"#)
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let body = session.get("Facility", ids[0]).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["Facility"]["name"], "Test Facility");
    assert_eq!(value["Facility"]["id"], ids[0]);

    let all = session.search("SELECT f.id FROM Facility f").await.unwrap();
    let ids_again: Vec<i64> = serde_json::from_str(&all).unwrap();
    assert_eq!(ids_again, ids);
}

#[actix_web::test]
async fn test_oversized_uri_fails_before_io() {
    let (url, stub) = spawn_stub().await;
    let icat = Icat::new(&url).unwrap();
    let session = icat
        .login("db", &credentials("root", "password"))
        .await
        .unwrap();

    let hits = stub.entity_manager_hits.load(Ordering::SeqCst);
    let err = session.search(&"x".repeat(3000)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadParameter);
    assert!(err.message.contains("exceeds 2048"));
    assert_eq!(stub.entity_manager_hits.load(Ordering::SeqCst), hits);
}

#[actix_web::test]
async fn test_error_envelope_offset() {
    let (url, _stub) = spawn_stub().await;
    let icat = Icat::new(&url).unwrap();
    let session = icat
        .login("db", &credentials("root", "password"))
        .await
        .unwrap();

    let err = session
        .delete(r#"{"Rule":{"id":1}}"#)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientPrivileges);
    assert_eq!(err.message, "Rules may only be deleted by root");
    assert_eq!(err.offset, 42);
}

#[actix_web::test]
async fn test_export_streams_port_file() {
    let (url, _stub) = spawn_stub().await;
    let icat = Icat::new(&url).unwrap();
    let session = icat
        .login("db", &credentials("root", "password"))
        .await
        .unwrap();
    session
        .write(r#"{"Facility":{"name":"Test Facility"}}"#)
        .await
        .unwrap();

    let export = session
        .export_meta_data(None, AttributeScope::User)
        .await
        .unwrap();
    let text = export.text().await.unwrap();
    let doc = icat_core::Document::parse(&text).unwrap();
    assert_eq!((doc.major, doc.minor), (1, 0));
    assert_eq!(doc.blocks[0].entity_type, "Facility");
    assert_eq!(
        doc.blocks[0].rows[0][0],
        icat_core::Literal::Str("Test Facility".into())
    );
}

#[actix_web::test]
async fn test_export_with_dead_session_fails() {
    let (url, _stub) = spawn_stub().await;
    let icat = Icat::new(&url).unwrap();
    let session = icat.get_session("no-such-session");
    let err = session
        .export_meta_data(None, AttributeScope::All)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Session);
}

#[actix_web::test]
async fn test_import_streams_file() {
    let (url, stub) = spawn_stub().await;
    let icat = Icat::new(&url).unwrap();
    let session = icat
        .login("db", &credentials("root", "password"))
        .await
        .unwrap();

    let contents = "# Version of file format\n1.0\n\nFacility(name:0)\n\"Imported\"\n";
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();

    session
        .import_meta_data(file.path(), DuplicateAction::Throw, AttributeScope::User)
        .await
        .unwrap();
    assert_eq!(stub.imported.lock().unwrap().as_deref(), Some(contents));
}

#[actix_web::test]
async fn test_search_documents_query_shape() {
    let (url, _stub) = spawn_stub().await;
    let icat = Icat::new(&url).unwrap();
    let session = icat
        .login("db", &credentials("root", "password"))
        .await
        .unwrap();

    let search = DataSearch {
        text: Some("helium".into()),
        max_count: 5,
        ..Default::default()
    };
    let body = session.search_datasets(&search).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["maxCount"], "5");
    let query: serde_json::Value =
        serde_json::from_str(value["received"].as_str().unwrap()).unwrap();
    assert_eq!(query["target"], "Dataset");
    assert_eq!(query["text"], "helium");
    assert!(query.get("samples").is_none());
}

#[actix_web::test]
async fn test_misc_operations() {
    let (url, _stub) = spawn_stub().await;
    let icat = Icat::new(&url).unwrap();
    assert_eq!(icat.get_version().await.unwrap(), "5.0.0");

    let session = icat
        .login("db", &credentials("root", "password"))
        .await
        .unwrap();
    assert_eq!(
        session.lucene_get_populating().await.unwrap(),
        vec!["Dataset", "Datafile"]
    );
    session.wait_millis(1).await.unwrap();
}
