use anyhow::Context;
use clap::{Parser, Subcommand};
use digisoft_funnel::ab_test::find_test;
use digisoft_funnel::analytics::{Analytics, TracingSink};
use digisoft_funnel::config::Config;
use digisoft_funnel::events::AbEventKind;
use digisoft_funnel::gateway_client::HttpLeadTransport;
use digisoft_funnel::platform::{RenderTarget, SystemClock, ThreadRandom};
use digisoft_funnel::storage::{FileStore, MemoryStore, StoreCookieJar};
use digisoft_funnel::validation::CONSENT_TEXT;
use digisoft_funnel::{FunnelPlatform, LeadFunnel, LeadPayload, SubmitOutcome};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "digisoft-funnel")]
#[command(about = "DigiSoft lead funnel - attribution, A/B buckets and lead delivery", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture UTM attribution from a landing URL
    CaptureUtm {
        /// Full URL or bare query string
        url: String,
    },

    /// Submit a lead to the capture API
    Submit {
        #[arg(long)]
        name: String,

        #[arg(long)]
        phone: String,

        #[arg(long)]
        email: Option<String>,

        /// Form or popup that produced the lead
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        campaign: Option<String>,

        #[arg(long)]
        property: Option<String>,

        /// Profiling stage (1-4)
        #[arg(long)]
        stage: Option<u8>,

        #[arg(long)]
        page_url: Option<String>,

        /// Record DPDP consent
        #[arg(long)]
        consent: bool,
    },

    /// Show (and assign if needed) the variant for an experiment
    Variant {
        test_id: String,

        /// Print one copy value instead of the whole variant
        #[arg(long)]
        key: Option<String>,
    },

    /// Record a conversion for an experiment
    Convert { test_id: String },

    /// Resend leads kept in the failed-delivery outbox
    ReplayFailed,

    /// Print the stored funnel state
    State,
}

fn build_funnel(config: &Config) -> anyhow::Result<LeadFunnel> {
    let local = Arc::new(
        FileStore::open(&config.storage_path)
            .with_context(|| format!("Failed to open {}", config.storage_path.display()))?,
    );
    let transport = HttpLeadTransport::new(
        &config.lead_api_base_url,
        &config.lead_capture_path,
        config.request_timeout(),
    )?;
    tracing::info!("Lead API endpoint: {}", transport.endpoint());

    let platform = FunnelPlatform {
        local: local.clone(),
        session: Arc::new(MemoryStore::with_idle_timeout(config.session_idle())),
        cookies: Arc::new(StoreCookieJar::new(local)),
        clock: Arc::new(SystemClock),
        random: Arc::new(ThreadRandom),
        render: RenderTarget::Browser,
    };

    Ok(LeadFunnel::new(
        platform,
        Arc::new(transport),
        config.trigger_settings(),
    )
    .with_analytics(Analytics::new(Some(Arc::new(TracingSink)))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "digisoft_funnel=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let funnel = build_funnel(&config)?;
    let forwarder = funnel.spawn_analytics();

    let result = run(&funnel, cli.command).await;

    // Closing the bus lets the forwarder drain pending events and stop.
    drop(funnel);
    if let Err(e) = forwarder.await {
        tracing::warn!("Analytics forwarder failed: {}", e);
    }
    result
}

async fn run(funnel: &LeadFunnel, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::CaptureUtm { url } => match funnel.navigate(&url)? {
            Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            None => println!("No UTM parameters found; stored attribution unchanged"),
        },
        Commands::Submit {
            name,
            phone,
            email,
            source,
            campaign,
            property,
            stage,
            page_url,
            consent,
        } => {
            let payload = LeadPayload {
                first_name: name,
                phone,
                email,
                source: source.or_else(|| Some("cli".to_string())),
                campaign_slug: campaign,
                property_interest: property,
                profile_stage: stage,
                consent_given: consent,
                consent_text: if consent {
                    CONSENT_TEXT.to_string()
                } else {
                    String::new()
                },
                ..Default::default()
            };

            let outcome = funnel.submit(payload, page_url.as_deref()).await;
            match &outcome {
                SubmitOutcome::Delivered => println!("Lead delivered"),
                SubmitOutcome::DeliveredWithError { error } => {
                    println!("Lead queued for replay after delivery failure: {}", error)
                }
                other => {
                    let message = other.message().unwrap_or_default();
                    anyhow::bail!("Lead not sent: {}", message);
                }
            }
        }
        Commands::Variant { test_id, key } => {
            let variant = funnel.assigner().variant(&test_id);
            match key {
                Some(key) => match funnel.assigner().variant_value(&test_id, &key) {
                    Some(value) => println!("{}", value),
                    None => anyhow::bail!("No value '{}' for test '{}'", key, test_id),
                },
                None => {
                    println!("{} => {}", test_id, variant);
                    if let Some(test) = find_test(&test_id) {
                        for (k, v) in test.values(variant) {
                            println!("  {} = {}", k, v);
                        }
                    }
                }
            }
        }
        Commands::Convert { test_id } => match funnel.assigner().record_conversion(&test_id) {
            Some(variant) => println!(
                "Conversion recorded for {} ({}), total {}",
                test_id,
                variant,
                funnel
                    .assigner()
                    .count(&test_id, variant, AbEventKind::Conversion)
            ),
            None => println!("No variant assigned for {}; nothing recorded", test_id),
        },
        Commands::ReplayFailed => {
            let report = funnel.replay_failed().await?;
            println!(
                "Replayed outbox: {} delivered, {} rejected, {} remaining",
                report.delivered, report.rejected, report.remaining
            );
        }
        Commands::State => {
            let snapshot = funnel.state().snapshot();
            println!("Stage:          {}", snapshot.current_stage);
            println!("Lead captured:  {}", snapshot.has_lead_been_captured);
            println!(
                "UTM:            {}",
                serde_json::to_string(&snapshot.utm_params)?
            );
            for (test_id, variant) in funnel.assigner().assignments() {
                println!("A/B {:<20} {}", test_id, variant);
            }
            let queued = funnel.guard().failed_leads()?;
            println!("Queued leads:   {}", queued.len());
        }
    }

    Ok(())
}
