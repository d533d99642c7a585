use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use platewatch::{
    api::{HealthResponse, RecognizeResponse},
    image::{Image, encode_jpeg},
};
use reqwest::{Body, Client, multipart};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};

// Simple test client to exercise a running platewatch service end-to-end
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Sends recognition requests to a platewatch service")]
struct Args {
    /// Origin for the requests
    #[clap(short, long, default_value = "http://127.0.0.1:4050")]
    origin: String,

    /// Optional image input path, a generated test image is sent if not given
    #[clap(short, long)]
    image: Option<String>,

    /// Number of requests to make
    #[clap(short, long, default_value_t = 1)]
    number_of_requests: u32,

    /// Interval in milliseconds for making requests
    #[clap(long, default_value_t = 1000)]
    interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = Client::new();
    let origin = reqwest::Url::parse(&args.origin)?;

    let health: HealthResponse = client
        .get(origin.join("health")?)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!(
        "Service {} ({}), recognizer {}",
        health.status, health.message, health.recognizer
    );

    let generated = match args.image {
        Some(_) => None,
        None => Some(test_image()?),
    };

    let pb = ProgressBar::new(args.number_of_requests as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    println!(
        "Calling {}, {} times with {} ms interval",
        args.origin, args.number_of_requests, args.interval
    );

    let start_time = Instant::now();
    let mut futures = Vec::with_capacity(args.number_of_requests as usize);
    for i in 0..args.number_of_requests {
        futures.push(tokio::task::spawn(send_recognize_request(
            client.clone(),
            origin.clone(),
            args.image.clone(),
            generated.clone(),
        )));
        pb.inc(1);
        if i + 1 < args.number_of_requests {
            tokio::time::sleep(Duration::from_millis(args.interval)).await;
        }
    }
    let results = futures::future::join_all(futures).await;
    pb.finish_with_message("All requests completed!");
    let runtime_duration = start_time.elapsed();

    let mut request_times: Vec<Duration> = Vec::with_capacity(results.len());
    let mut inference_times: Vec<i32> = Vec::with_capacity(results.len());
    let mut processing_times: Vec<i32> = Vec::with_capacity(results.len());
    let mut last_response = None;
    let mut failures = 0;

    for result in results {
        match result {
            Ok(Ok((response, request_time))) => {
                inference_times.push(response.inference_ms);
                processing_times.push(response.process_ms);
                request_times.push(request_time);
                last_response = Some(response);
            }
            Ok(Err(e)) => {
                eprintln!("Request failed: {e}");
                failures += 1;
            }
            Err(e) => {
                eprintln!("Request task failed: {e}");
                failures += 1;
            }
        }
    }

    if let Some(response) = last_response {
        println!("{:#?}", response);
    }
    println!("Runtime duration: {:?}", runtime_duration);
    summarize("Request times", &request_times, |values| {
        values.iter().sum::<Duration>() / values.len() as u32
    });
    summarize("Inference times (ms)", &inference_times, average_ms);
    summarize("Processing times (ms)", &processing_times, average_ms);

    if failures > 0 {
        anyhow::bail!("{failures} of {} requests failed", args.number_of_requests);
    }
    Ok(())
}

fn average_ms(values: &[i32]) -> i32 {
    values.iter().sum::<i32>() / values.len() as i32
}

fn summarize<T: Ord + std::fmt::Debug>(label: &str, values: &[T], average: impl Fn(&[T]) -> T) {
    let (Some(min), Some(max)) = (values.iter().min(), values.iter().max()) else {
        println!("No {} to summarize", label.to_lowercase());
        return;
    };
    let avg = average(values);
    println!("{label} -- min: {min:?}, avg: {avg:?}, max: {max:?}");
}

/// Gray frame with a white plate-sized block, enough to exercise the full path.
fn test_image() -> anyhow::Result<bytes::Bytes> {
    let (width, height) = (640, 480);
    let mut pixels = vec![96u8; width * height * 3];
    for y in 300..360 {
        for x in 220..420 {
            let offset = (y * width + x) * 3;
            pixels[offset..offset + 3].fill(245);
        }
    }
    let image = Image::from_rgb(width, height, pixels)?;
    encode_jpeg(&image, 90)
}

async fn send_recognize_request(
    client: Client,
    origin: reqwest::Url,
    image: Option<String>,
    generated: Option<bytes::Bytes>,
) -> anyhow::Result<(RecognizeResponse, Duration)> {
    let url = origin.join("recognize")?;

    let image_part = match (image, generated) {
        (Some(image), _) => {
            let file = File::open(image).await?;
            let stream = FramedRead::new(file, BytesCodec::new());
            multipart::Part::stream(Body::wrap_stream(stream)).file_name("image.jpg")
        }
        (None, Some(generated)) => multipart::Part::bytes(generated.to_vec()).file_name("image.jpg"),
        (None, None) => anyhow::bail!("No image to send"),
    };
    let form = multipart::Form::new().part("image", image_part);

    let request_start_time = Instant::now();
    let response = client.post(url).multipart(form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Request failed with status {status}, body: {body}");
    }
    let response = response.json::<RecognizeResponse>().await?;
    if !response.success {
        anyhow::bail!(
            "Recognition failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    Ok((response, request_start_time.elapsed()))
}
