use crate::app::{AppContext, EstuaryError, Result};
use crate::domain::User;
use crate::store::Store;

pub async fn add_feed(ctx: &AppContext, url: &str, user: Option<&str>) -> Result<()> {
    if let Some(login) = user {
        if ctx.store.get_user(login)?.is_none() {
            return Err(EstuaryError::InvalidInput(format!("unknown user '{}'", login)));
        }
    }

    // Unread records and thumbnails for the initial articles come from the
    // monitors.
    ctx.attach_monitors().await?;
    let added = ctx.manager.add_feed_for_user(url, user).await;
    ctx.drain().await;

    let feed = added?;
    println!("Added feed: {}", feed.link);
    if !feed.title.is_empty() {
        println!("Feed title: {}", feed.title);
    }
    println!("{} articles", ctx.store.get_feed_articles(feed.id)?.len());

    if !feed.subscribe_error.is_empty() {
        eprintln!("Hub subscription failed: {}", feed.subscribe_error);
    }
    Ok(())
}

pub async fn remove_feed(ctx: &AppContext, url: &str) -> Result<()> {
    let feed = ctx
        .store
        .get_feed_by_link(url)?
        .ok_or_else(|| EstuaryError::FeedNotFound(url.to_string()))?;

    ctx.attach_monitors().await?;
    let removed = ctx.manager.remove_feed(&feed).await;
    ctx.drain().await;

    removed?;
    println!("Removed feed: {}", url);
    Ok(())
}

pub async fn discover(ctx: &AppContext, query: &str) -> Result<()> {
    let feeds = ctx.manager.discover_feeds(query).await?;

    if feeds.is_empty() {
        println!("No feeds found");
        return Ok(());
    }

    for feed in feeds {
        println!("{}\n  {}", feed.display_title(), feed.link);
    }
    Ok(())
}

pub fn list_feeds(ctx: &AppContext) -> Result<()> {
    let feeds = ctx.store.get_all_feeds()?;

    if feeds.is_empty() {
        println!("No feeds");
        return Ok(());
    }

    for feed in feeds {
        let users = ctx.store.count_feed_users(feed.id)?;
        println!("{} ({} users)\n  {}", feed.display_title(), users, feed.link);
        if !feed.update_error.is_empty() {
            println!("  last error: {}", feed.update_error);
        }
    }

    Ok(())
}

pub fn list_articles(ctx: &AppContext) -> Result<()> {
    let feeds = ctx.store.get_all_feeds()?;
    let mut printed = 0;

    for feed in feeds {
        for article in ctx.manager.feed_articles(feed.id)? {
            println!(
                "{} {} [{}]",
                article.date.format("%Y-%m-%d"),
                article.display_title(),
                feed.display_title()
            );
            printed += 1;
        }
    }

    if printed == 0 {
        println!("No articles");
    }
    Ok(())
}

pub fn add_user(ctx: &AppContext, login: &str) -> Result<()> {
    let login = login.trim();
    if login.is_empty() {
        return Err(EstuaryError::InvalidInput("empty login".to_string()));
    }

    ctx.store.add_user(&User::new(login))?;
    println!("Added user: {}", login);
    Ok(())
}
