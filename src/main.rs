use scoped_http::{Request, RequestExecutor, ResponseResult, TimeoutPolicy};

const DEFAULT_GET_URL: &str = "http://localhost:8080/qw/v1/qwAgent/test";
const DEFAULT_POST_URL: &str = "http://localhost:8080/qw/v1/qwAgent/test2";

fn report(label: &str, result: &ResponseResult) {
    match result {
        ResponseResult::Success { status, body, .. } => {
            log::info!("{}: {} {}", label, status, body)
        }
        ResponseResult::HttpError { status, .. } => {
            log::warn!("{}: unexpected response status {}", label, status)
        }
        ResponseResult::TransportFault(e) => log::error!("{}: {}", label, e),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let get_url = args.next().unwrap_or_else(|| DEFAULT_GET_URL.to_string());
    let post_url = args.next().unwrap_or_else(|| DEFAULT_POST_URL.to_string());
    let executor = RequestExecutor::new();
    let timeouts = TimeoutPolicy::default();

    let get = executor.execute_async(Request::get(get_url), timeouts);
    let post = executor.execute_async(
        Request::post_json(post_url, r#"{"data":"zhangsan"}"#),
        timeouts,
    );
    let (get, post) = tokio::join!(get, post);

    report("GET", &get);
    report("POST", &post);
}
